//! Well-known endpoint identifiers.
//!
//! The core treats channel identifiers as opaque strings; these constants
//! exist for the services built on top of it.

/// Lockdown service names for the three instrumentation protocol
/// generations.
pub mod service {
    /// iOS < 14.
    pub const INSTRUMENTS_LEGACY: &str = "com.apple.instruments.remoteserver";
    /// iOS 14–16 (TLS handshake-only transport).
    pub const INSTRUMENTS_SECURE_PROXY: &str =
        "com.apple.instruments.remoteserver.DVTSecureSocketProxy";
    /// iOS 17+ (reached through a tunnel).
    pub const INSTRUMENTS_SERVICE_HUB: &str = "com.apple.instruments.dtservicehub";
    pub const TESTMANAGERD: &str = "com.apple.testmanagerd.lockdown";
    pub const TESTMANAGERD_SECURE: &str = "com.apple.testmanagerd.lockdown.secure";
}

/// Channel identifiers served by the instrumentation daemon.
pub mod channel {
    pub const DEVICE_INFO: &str = "com.apple.instruments.server.services.deviceinfo";
    pub const PROCESS_CONTROL: &str = "com.apple.instruments.server.services.processcontrol";
    pub const PROCESS_CONTROL_POSIX_SPAWN: &str =
        "com.apple.instruments.server.services.processcontrol.posixspawn";
    pub const SYSMONTAP: &str = "com.apple.instruments.server.services.sysmontap";
    pub const GRAPHICS_OPENGL: &str = "com.apple.instruments.server.services.graphics.opengl";
    pub const SCREENSHOT: &str = "com.apple.instruments.server.services.screenshot";
    pub const MOBILE_NOTIFICATIONS: &str =
        "com.apple.instruments.server.services.mobilenotifications";
    pub const XPC_CONTROL: &str = "com.apple.instruments.server.services.device.xpccontrol";
    pub const APP_LISTING: &str =
        "com.apple.instruments.server.services.device.applictionListing";
    pub const ACTIVITY_TRACE_TAP: &str =
        "com.apple.instruments.server.services.activitytracetap";
    pub const CONDITION_INDUCER: &str =
        "com.apple.instruments.server.services.ConditionInducer";
    pub const LOCATION_SIMULATION: &str =
        "com.apple.instruments.server.services.LocationSimulation";
    pub const ASSETS: &str = "com.apple.instruments.server.services.assets";
}
