use std::collections::BTreeMap;

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
  declaration::Toleration,
  keys::{self, DECLARATION_LABEL, PACKAGE_LABEL},
  node_record::Stage,
};

/// The JSON fingerprint stamped on every worker object's
/// `skyhook.nvidia.com/package` annotation (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerFingerprint {
  pub name: String,
  pub version: String,
  /// The declaration this worker belongs to.
  pub skyhook: String,
  pub stage: Stage,
  pub image: String,
}

/// One transient execution of `(node, package, stage)` (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerObject {
  pub node: String,
  pub declaration: String,
  pub package_name: String,
  pub package_version: String,
  pub stage: Stage,
  pub image: String,
  pub labels: BTreeMap<String, String>,
  pub annotations: BTreeMap<String, String>,
  pub tolerations: Vec<Toleration>,
  pub init_containers: Vec<InitContainer>,
  #[serde(default)]
  pub restarts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitContainer {
  pub name: String,
  pub args: Vec<String>,
  pub env: Vec<(String, String)>,
}

impl WorkerObject {
  pub fn fingerprint(&self) -> WorkerFingerprint {
    WorkerFingerprint {
      name: self.package_name.clone(),
      version: self.package_version.clone(),
      skyhook: self.declaration.clone(),
      stage: self.stage,
      image: self.image.clone(),
    }
  }

  pub fn labels_for(declaration: &str, name: &str, version: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
      (DECLARATION_LABEL.to_string(), declaration.to_string()),
      (
        PACKAGE_LABEL.to_string(),
        format!("{name}-{version}"),
      ),
    ])
  }
}

/// Compose the argv contract dispatched to the node agent:
/// `[stage, <root-dir>, <base64(extra-json)>?]` (spec.md §6).
pub fn compose_args(
  stage: Stage,
  root_dir: &str,
  extra: Option<&Value>,
) -> Vec<String> {
  let mut args = vec![stage_arg(stage), root_dir.to_string()];
  if let Some(extra) = extra {
    let encoded = base64::engine::general_purpose::STANDARD
      .encode(extra.to_string());
    args.push(encoded);
  }
  args
}

fn stage_arg(stage: Stage) -> String {
  stage.to_string()
}

/// `<pkg>-init`, `<pkg>-<stage>`, `<pkg>-<stage>check` init-container chain
/// wrapping a holding (pause-image) container, per spec.md §4.4.
pub fn init_container_names(package: &str, stage: Stage) -> [String; 3] {
  let stage = stage_arg(stage);
  [
    format!("{package}-init"),
    format!("{package}-{stage}"),
    format!("{package}-{stage}check"),
  ]
}

pub fn node_state_label_key(declaration: &str) -> String {
  keys::status_key(declaration)
}
