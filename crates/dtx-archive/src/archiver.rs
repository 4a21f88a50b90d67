//! Keyed-archive encoder.
//!
//! Encoding walks the value graph leaves-first: every scalar gets its own
//! entry in the flat `$objects` table, containers are emitted after their
//! children so the UID references they hold are already valid, and each
//! container appends its own class descriptor. UID 0 is the `$null`
//! sentinel. The resulting table is wrapped in the standard archive
//! envelope and serialized as a binary property list.

use plist::{Dictionary, Integer, Uid};

use crate::{ArchiveError, ClassInfo, Value};

const ARCHIVER_NAME: &str = "NSKeyedArchiver";
const ARCHIVE_VERSION: u64 = 100_000;

/// Serialize a value graph as a keyed archive (binary property list).
///
/// Container classes default by shape (`NSArray`, `NSDictionary`, `NSSet`)
/// unless the value carries an explicit class via [`Value::with_class`].
pub fn archive(root: &Value) -> Result<Vec<u8>, ArchiveError> {
    let mut ctx = Context::new();
    let root_uid = ctx.encode(root);

    let mut top = Dictionary::new();
    top.insert("root".into(), plist::Value::Uid(Uid::new(root_uid)));

    let mut envelope = Dictionary::new();
    envelope.insert("$archiver".into(), plist::Value::String(ARCHIVER_NAME.into()));
    envelope.insert(
        "$version".into(),
        plist::Value::Integer(Integer::from(ARCHIVE_VERSION)),
    );
    envelope.insert("$top".into(), plist::Value::Dictionary(top));
    envelope.insert("$objects".into(), plist::Value::Array(ctx.objects));

    let mut out = Vec::new();
    plist::Value::Dictionary(envelope).to_writer_binary(&mut out)?;
    Ok(out)
}

struct Context {
    objects: Vec<plist::Value>,
}

impl Context {
    fn new() -> Self {
        Self {
            // Index 0 is always the null sentinel.
            objects: vec![plist::Value::String("$null".into())],
        }
    }

    fn push(&mut self, obj: plist::Value) -> u64 {
        let uid = self.objects.len() as u64;
        self.objects.push(obj);
        uid
    }

    /// Encode a value and return its UID in the object table.
    fn encode(&mut self, value: &Value) -> u64 {
        // Class wrappers only matter for containers; scalars archive as
        // direct property-list entries either way.
        let class = explicit_class(value);
        match value.unclassed() {
            Value::Null => 0,
            Value::Bool(b) => self.push(plist::Value::Boolean(*b)),
            Value::I32(v) => self.push(plist::Value::Integer(Integer::from(i64::from(*v)))),
            Value::I64(v) => self.push(plist::Value::Integer(Integer::from(*v))),
            Value::U64(v) => self.push(plist::Value::Integer(Integer::from(*v))),
            Value::F32(v) => self.push(plist::Value::Real(f64::from(*v))),
            Value::F64(v) => self.push(plist::Value::Real(*v)),
            Value::String(s) => self.push(plist::Value::String(s.clone())),
            Value::Data(d) => self.push(plist::Value::Data(d.clone())),
            Value::Array(items) => {
                self.encode_list(items, class, "NSArray", &["NSArray", "NSObject"])
            }
            Value::Set(items) => self.encode_list(items, class, "NSSet", &["NSSet", "NSObject"]),
            Value::Dict(map) => {
                let key_uids: Vec<u64> = map
                    .keys()
                    .map(|k| self.push(plist::Value::String(k.clone())))
                    .collect();
                let value_uids: Vec<u64> = map.values().map(|v| self.encode(v)).collect();

                let mut node = Dictionary::new();
                node.insert("NS.keys".into(), uid_array(&key_uids));
                node.insert("NS.objects".into(), uid_array(&value_uids));
                let class_uid = self.push_class(
                    class,
                    "NSDictionary",
                    &["NSDictionary", "NSObject"],
                );
                node.insert("$class".into(), plist::Value::Uid(Uid::new(class_uid)));
                self.push(plist::Value::Dictionary(node))
            }
            Value::Classed(_) => unreachable!("unclassed strips wrappers"),
        }
    }

    fn encode_list(
        &mut self,
        items: &[Value],
        class: Option<&ClassInfo>,
        default_name: &str,
        default_hierarchy: &[&str],
    ) -> u64 {
        let item_uids: Vec<u64> = items.iter().map(|item| self.encode(item)).collect();

        let mut node = Dictionary::new();
        node.insert("NS.objects".into(), uid_array(&item_uids));
        let class_uid = self.push_class(class, default_name, default_hierarchy);
        node.insert("$class".into(), plist::Value::Uid(Uid::new(class_uid)));
        self.push(plist::Value::Dictionary(node))
    }

    /// Append a class descriptor `{$classname, $classes}` and return its UID.
    fn push_class(
        &mut self,
        explicit: Option<&ClassInfo>,
        default_name: &str,
        default_hierarchy: &[&str],
    ) -> u64 {
        let (name, hierarchy): (&str, Vec<String>) = match explicit {
            Some(info) if !info.hierarchy.is_empty() => {
                (info.name.as_str(), info.hierarchy.clone())
            }
            Some(info) => (
                info.name.as_str(),
                default_hierarchy.iter().map(|s| s.to_string()).collect(),
            ),
            None => (
                default_name,
                default_hierarchy.iter().map(|s| s.to_string()).collect(),
            ),
        };

        let mut descriptor = Dictionary::new();
        descriptor.insert("$classname".into(), plist::Value::String(name.to_string()));
        descriptor.insert(
            "$classes".into(),
            plist::Value::Array(hierarchy.into_iter().map(plist::Value::String).collect()),
        );
        self.push(plist::Value::Dictionary(descriptor))
    }
}

fn explicit_class(value: &Value) -> Option<&ClassInfo> {
    match value {
        Value::Classed(c) => Some(&c.class),
        _ => None,
    }
}

fn uid_array(uids: &[u64]) -> plist::Value {
    plist::Value::Array(
        uids.iter()
            .map(|&uid| plist::Value::Uid(Uid::new(uid)))
            .collect(),
    )
}
