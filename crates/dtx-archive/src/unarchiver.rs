//! Keyed-archive decoder.
//!
//! Decoding parses the property list, follows `$top` into the flat object
//! table, and resolves UID references recursively. Container objects are
//! dispatched on their `$classname`; anything unrecognized decodes to a
//! mapping with a `$class` key so no peer payload is ever unrepresentable.

use std::io::Cursor;
use std::time::{SystemTime, UNIX_EPOCH};

use plist::Dictionary;

use crate::{ArchiveError, Dict, Value};

/// Decode a keyed archive (or plain property list) into a [`Value`].
///
/// Only an unparseable property list is an error; unknown classes and
/// structurally odd archives decode best-effort.
pub fn unarchive(data: &[u8]) -> Result<Value, ArchiveError> {
    let root = plist::Value::from_reader(Cursor::new(data))?;

    let envelope = match root {
        plist::Value::Dictionary(d) if d.get("$archiver").is_some() => d,
        other => return Ok(decode_plain(&other)),
    };

    let (Some(plist::Value::Array(objects)), Some(plist::Value::Dictionary(top))) =
        (envelope.get("$objects"), envelope.get("$top"))
    else {
        tracing::warn!("keyed archive missing $objects or $top");
        return Ok(Value::Null);
    };

    // $top usually holds a single "root" entry; some producers use "$0",
    // some emit several entries.
    if let Some(node) = top.get("root").or_else(|| top.get("$0")) {
        return Ok(decode_value(objects, node));
    }

    let mut items: Vec<Value> = top.values().map(|node| decode_value(objects, node)).collect();
    Ok(match items.len() {
        1 => items.remove(0),
        _ => Value::Array(items),
    })
}

/// Resolve a node that may be a UID reference into the object table.
fn decode_value(objects: &[plist::Value], node: &plist::Value) -> Value {
    match node {
        plist::Value::Uid(uid) => match objects.get(uid.get() as usize) {
            Some(resolved) => decode_object(objects, resolved),
            None => Value::Null,
        },
        other => decode_object(objects, other),
    }
}

fn decode_object(objects: &[plist::Value], node: &plist::Value) -> Value {
    let dict = match node {
        plist::Value::String(s) if s == "$null" => return Value::Null,
        plist::Value::Dictionary(d) => d,
        other => return decode_plain(other),
    };

    let Some(class_name) = class_name(objects, dict) else {
        // A dictionary without $class is an inline plist value.
        return decode_plain(node);
    };

    match class_name.as_str() {
        "NSArray" | "NSMutableArray" => Value::Array(decode_members(objects, dict)),
        "NSSet" | "NSMutableSet" => Value::Set(decode_members(objects, dict)),
        "NSDictionary" | "NSMutableDictionary" => decode_ns_dictionary(objects, dict),
        "NSData" | "NSMutableData" => decode_indirect(objects, dict, "NS.data")
            .unwrap_or(Value::Data(Vec::new())),
        "NSString" | "NSMutableString" => decode_indirect(objects, dict, "NS.string")
            .unwrap_or(Value::String(String::new())),
        "NSNumber" | "NSValue" => dict
            .get("NS.intval")
            .or_else(|| dict.get("NS.dblval"))
            .map(|node| decode_value(objects, node))
            .unwrap_or(Value::Null),
        "NSDate" => decode_indirect(objects, dict, "NS.time").unwrap_or(Value::F64(0.0)),
        "NSUUID" => decode_indirect(objects, dict, "NS.uuidbytes")
            .unwrap_or(Value::Data(Vec::new())),
        "NSError" | "NSException" => {
            let mut out = Dict::new();
            out.insert("$class".into(), Value::String(class_name.clone()));
            if let Some(node) = dict.get("NSDomain") {
                out.insert("domain".into(), decode_value(objects, node));
            }
            if let Some(node) = dict.get("NSCode") {
                out.insert("code".into(), decode_value(objects, node));
            }
            if let Some(node) = dict.get("NSUserInfo") {
                out.insert("userInfo".into(), decode_value(objects, node));
            }
            Value::Dict(out)
        }
        "NSURL" => decode_indirect(objects, dict, "NS.relative")
            .unwrap_or(Value::String(String::new())),
        // Tap messages wrap a second property list in a data field.
        "DTTapMessage" | "DTSysmonTapMessage" => {
            match decode_indirect(objects, dict, "DTTapMessagePlist") {
                Some(Value::Data(inner)) if !inner.is_empty() => {
                    match plist::Value::from_reader(Cursor::new(&inner)) {
                        Ok(parsed) => decode_plain(&parsed),
                        Err(e) => {
                            tracing::warn!(error = %e, "tap message carries unparseable plist");
                            Value::Null
                        }
                    }
                }
                _ => Value::Null,
            }
        }
        "XCTCapabilities" => match dict.get("capabilities-dictionary") {
            Some(node) => decode_value(objects, node),
            None => decode_unknown(objects, dict, &class_name),
        },
        _ => decode_unknown(objects, dict, &class_name),
    }
}

/// Follow a container's `$class` UID to its descriptor's `$classname`.
fn class_name(objects: &[plist::Value], dict: &Dictionary) -> Option<String> {
    let uid = match dict.get("$class") {
        Some(plist::Value::Uid(uid)) => uid.get(),
        _ => return None,
    };
    match objects.get(uid as usize) {
        Some(plist::Value::Dictionary(descriptor)) => match descriptor.get("$classname") {
            Some(plist::Value::String(name)) => Some(name.clone()),
            _ => None,
        },
        _ => None,
    }
}

/// Unknown classes keep every field, plus the class name under `$class`.
fn decode_unknown(objects: &[plist::Value], dict: &Dictionary, class_name: &str) -> Value {
    tracing::debug!(class = class_name, "unknown archive class, decoding as mapping");
    let mut out = Dict::new();
    out.insert("$class".into(), Value::String(class_name.to_string()));
    for (key, node) in dict.iter() {
        if key == "$class" {
            continue;
        }
        out.insert(key.to_string(), decode_value(objects, node));
    }
    Value::Dict(out)
}

fn decode_members(objects: &[plist::Value], dict: &Dictionary) -> Vec<Value> {
    match dict.get("NS.objects") {
        Some(plist::Value::Array(nodes)) => nodes
            .iter()
            .map(|node| decode_value(objects, node))
            .collect(),
        _ => Vec::new(),
    }
}

fn decode_ns_dictionary(objects: &[plist::Value], dict: &Dictionary) -> Value {
    let (Some(plist::Value::Array(keys)), Some(plist::Value::Array(values))) =
        (dict.get("NS.keys"), dict.get("NS.objects"))
    else {
        return Value::Dict(Dict::new());
    };

    let mut out = Dict::new();
    for (key_node, value_node) in keys.iter().zip(values) {
        let key = decode_value(objects, key_node);
        let key = match key.as_str() {
            Some(s) => s.to_string(),
            None => key.to_string(),
        };
        out.insert(key, decode_value(objects, value_node));
    }
    Value::Dict(out)
}

/// Fetch a field that may be stored inline or behind a UID.
fn decode_indirect(objects: &[plist::Value], dict: &Dictionary, key: &str) -> Option<Value> {
    dict.get(key).map(|node| decode_value(objects, node))
}

/// Decode a plain plist node (no UID graph).
fn decode_plain(node: &plist::Value) -> Value {
    match node {
        plist::Value::Boolean(b) => Value::Bool(*b),
        plist::Value::Integer(i) => integer_value(*i),
        plist::Value::Real(r) => Value::F64(*r),
        plist::Value::String(s) => Value::String(s.clone()),
        plist::Value::Data(d) => Value::Data(d.clone()),
        plist::Value::Date(d) => Value::F64(epoch_seconds(*d)),
        plist::Value::Array(items) => Value::Array(items.iter().map(decode_plain).collect()),
        plist::Value::Dictionary(map) => Value::Dict(
            map.iter()
                .map(|(k, v)| (k.to_string(), decode_plain(v)))
                .collect(),
        ),
        // A dangling UID outside an archive has nothing to point at.
        _ => Value::Null,
    }
}

/// Integers with the sign bit set were written unsigned; promote them.
fn integer_value(i: plist::Integer) -> Value {
    if let Some(u) = i.as_unsigned() {
        if u > i64::MAX as u64 {
            return Value::U64(u);
        }
        return Value::I64(u as i64);
    }
    match i.as_signed() {
        Some(s) if s < 0 => Value::U64(s as u64),
        Some(s) => Value::I64(s),
        None => Value::Null,
    }
}

fn epoch_seconds(date: plist::Date) -> f64 {
    let time = SystemTime::from(date);
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}
