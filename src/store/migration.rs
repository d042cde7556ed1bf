//! Migration (C8, spec.md §4.8): rewrite legacy `NodeRecord` shapes in
//! place before typed deserialization.
//!
//! Two legacy shapes are recognized:
//! - a `packages` key without the `name|version` separator (just the bare
//!   package name), from before packages could appear at more than one
//!   version concurrently;
//! - a package entry missing the `image` field, from before image
//!   references were tracked in the store.

use serde_json::{Value, json};

pub fn migrate(mut record: Value) -> Value {
  let Some(packages) = record
    .get_mut("packages")
    .and_then(|p| p.as_object_mut())
  else {
    return record;
  };

  let mut migrated = serde_json::Map::new();
  for (key, mut entry) in std::mem::take(packages).into_iter() {
    backfill_image(&mut entry);
    let new_key = if key.contains('|') {
      key
    } else {
      let version = entry
        .get("version")
        .and_then(|v| v.as_str())
        .unwrap_or("0.0.0")
        .to_string();
      format!("{key}|{version}")
    };
    migrated.insert(new_key, entry);
  }

  record["packages"] = Value::Object(migrated);
  record
}

fn backfill_image(entry: &mut Value) {
  let Some(obj) = entry.as_object_mut() else {
    return;
  };
  if !obj.contains_key("image") || obj["image"].is_null() {
    obj.insert("image".to_string(), json!(""));
  }
  if !obj.contains_key("restarts") {
    obj.insert("restarts".to_string(), json!(0));
  }
}
