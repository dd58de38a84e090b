use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_yaml::Value;

use crate::{Error, Result};

/// Read every object of a YAML or JSON manifest file.
///
/// Documents are separated by `---`; empty documents are skipped and `List` kinds are flattened
/// into their items.
pub fn read_manifests<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let contents = std::fs::read_to_string(path)?;
    parse_manifests(&contents)
}

/// Read the single object of a manifest file.
pub fn read_manifest<T: DeserializeOwned>(path: &Path) -> Result<T> {
    read_manifests(path)?
        .into_iter()
        .next()
        .ok_or_else(|| Error::EmptyManifest(path.display().to_string()))
}

pub fn parse_manifests<T: DeserializeOwned>(contents: &str) -> Result<Vec<T>> {
    let mut objects = vec![];
    for document in serde_yaml::Deserializer::from_str(contents) {
        let value = Value::deserialize(document)?;
        match value {
            Value::Null => {}
            Value::Mapping(ref mapping) if is_list(mapping) => {
                if let Some(Value::Sequence(items)) = mapping.get("items") {
                    for item in items {
                        objects.push(serde_yaml::from_value(item.clone())?);
                    }
                }
            }
            value => objects.push(serde_yaml::from_value(value)?),
        }
    }
    Ok(objects)
}

fn is_list(mapping: &serde_yaml::Mapping) -> bool {
    mapping
        .get("kind")
        .and_then(Value::as_str)
        .is_some_and(|kind| kind.ends_with("List"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::virtualmachineinstancepresets::VirtualMachineInstancePreset;
    use k8s_openapi::api::core::v1::LimitRange;

    #[test]
    fn parses_multiple_documents() {
        let presets: Vec<VirtualMachineInstancePreset> = parse_manifests(
            r#"
---
apiVersion: kubevirt.io/v1
kind: VirtualMachineInstancePreset
metadata:
  name: small
spec:
  selector:
    matchLabels:
      size: small
  domain:
    cpu:
      cores: 1
    devices: {}
---
apiVersion: kubevirt.io/v1
kind: VirtualMachineInstancePreset
metadata:
  name: large
spec:
  selector: {}
---
"#,
        )
        .unwrap();

        assert_eq!(presets.len(), 2);
        assert_eq!(presets[0].metadata.name.as_deref(), Some("small"));
        assert_eq!(presets[1].spec.domain, None);
    }

    #[test]
    fn flattens_lists() {
        let limit_ranges: Vec<LimitRange> = parse_manifests(
            r#"{
              "apiVersion": "v1",
              "kind": "List",
              "items": [
                {
                  "apiVersion": "v1",
                  "kind": "LimitRange",
                  "metadata": {"name": "mem", "namespace": "default"},
                  "spec": {"limits": [{"type": "Container", "default": {"memory": "128M"}}]}
                }
              ]
            }"#,
        )
        .unwrap();

        assert_eq!(limit_ranges.len(), 1);
        assert_eq!(limit_ranges[0].metadata.name.as_deref(), Some("mem"));
    }

    #[test]
    fn empty_manifest() {
        assert!(parse_manifests::<LimitRange>("").unwrap().is_empty());
    }
}
