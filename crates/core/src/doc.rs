//! Accessors over raw resource documents (`serde_json::Value`).

use serde_json::{Map, Value};

use crate::ObjectError;

fn metadata_str<'a>(doc: &'a Value, key: &str) -> Option<&'a str> {
    doc.get("metadata").and_then(|m| m.get(key)).and_then(|v| v.as_str())
}

/// `metadata.uid`; unique within a resource type.
pub fn uid(doc: &Value) -> Result<&str, ObjectError> {
    metadata_str(doc, "uid").ok_or_else(|| ObjectError::missing("metadata.uid", doc))
}

pub fn name(doc: &Value) -> Result<&str, ObjectError> {
    metadata_str(doc, "name").ok_or_else(|| ObjectError::missing("metadata.name", doc))
}

pub fn namespace(doc: &Value) -> Result<&str, ObjectError> {
    metadata_str(doc, "namespace").ok_or_else(|| ObjectError::missing("metadata.namespace", doc))
}

/// `spec.nodeName`, `None` when absent or empty.
pub fn node_name(doc: &Value) -> Option<&str> {
    doc.get("spec")
        .and_then(|s| s.get("nodeName"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
}

pub fn phase(doc: &Value) -> Option<&str> {
    doc.get("status").and_then(|s| s.get("phase")).and_then(|v| v.as_str())
}

/// Name used in log lines; falls back to the uid or a placeholder.
pub fn display_name(doc: &Value) -> &str {
    metadata_str(doc, "name").or_else(|| metadata_str(doc, "uid")).unwrap_or("<unnamed>")
}

/// Set `spec.nodeName`, creating `spec` when missing.
pub fn set_node_name(doc: &mut Value, node: &str) -> Result<(), ObjectError> {
    let Some(obj) = doc.as_object_mut() else {
        return Err(ObjectError::missing("spec", doc));
    };
    let spec = obj.entry("spec").or_insert_with(|| Value::Object(Map::new()));
    if !spec.is_object() {
        *spec = Value::Object(Map::new());
    }
    if let Some(spec) = spec.as_object_mut() {
        spec.insert("nodeName".to_string(), Value::String(node.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod() -> Value {
        json!({
            "metadata": {"uid": "p1", "name": "a", "namespace": "ns"},
            "spec": {},
            "status": {"phase": "Pending"}
        })
    }

    #[test]
    fn reads_identity_fields() {
        let p = pod();
        assert_eq!(uid(&p).unwrap(), "p1");
        assert_eq!(name(&p).unwrap(), "a");
        assert_eq!(namespace(&p).unwrap(), "ns");
        assert_eq!(phase(&p), Some("Pending"));
        assert_eq!(node_name(&p), None);
    }

    #[test]
    fn missing_uid_is_malformed() {
        let p = json!({"metadata": {"name": "a"}});
        let err = uid(&p).unwrap_err();
        assert!(matches!(err, ObjectError::Malformed { field: "metadata.uid", .. }));
        assert_eq!(display_name(&p), "a");
    }

    #[test]
    fn empty_node_name_counts_as_unplaced() {
        let p = json!({"spec": {"nodeName": ""}});
        assert_eq!(node_name(&p), None);
    }

    #[test]
    fn set_node_name_creates_spec() {
        let mut p = json!({"metadata": {"uid": "p1"}});
        set_node_name(&mut p, "node-1").unwrap();
        assert_eq!(node_name(&p), Some("node-1"));

        let mut q = pod();
        set_node_name(&mut q, "node-2").unwrap();
        assert_eq!(q["spec"]["nodeName"], "node-2");
        assert_eq!(q["status"]["phase"], "Pending");
    }

    #[test]
    fn set_node_name_rejects_non_objects() {
        let mut v = json!("pod");
        assert!(set_node_name(&mut v, "n").is_err());
    }
}
