//! Cloud-init injection
//!
//! The enrollment commands travel to the guest as cloud-config `runcmd`
//! entries. A VM that already has a cloud-init volume keeps its user data:
//! the document is parsed, the enrollment keys are merged in and the field is
//! replaced. Otherwise a `cloudinitdisk` NoCloud volume (and its disk) is
//! added.
//!
//! Injection is planned from the incoming object before anything is
//! registered in FreeIPA, so a VM whose boot configuration cannot be merged is
//! denied without leaving a host entry behind.

use crate::error::MutationError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use json_patch::{AddOperation, PatchOperation, ReplaceOperation};
use jsonptr::PointerBuf;
use serde_json::{Value, json};
use serde_yaml::Mapping;

/// Name of the volume and disk carrying cloud-init data
pub const CLOUD_INIT_VOLUME: &str = "cloudinitdisk";

/// First line of a cloud-config document
pub const CLOUD_CONFIG_HEADER: &str = "#cloud-config";

const NO_CLOUD: &str = "cloudInitNoCloud";
const CONFIG_DRIVE: &str = "cloudInitConfigDrive";

// User data formats cloud-init dispatches on that are not cloud-config
const FOREIGN_HEADERS: &[&str] = &[
    "#include",
    "#cloud-boothook",
    "#part-handler",
    "#upstart-job",
    "#cloud-config-archive",
    "#cloud-config-jsonp",
];

/// What the guest has to do on first boot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootScript {
    /// Short host name
    pub hostname: String,
    pub fqdn: String,
    /// Appended to `runcmd` in order
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Plain,
    Base64,
}

#[derive(Debug, Clone)]
enum DiskAction {
    /// A `cloudinitdisk` disk is already declared
    Keep,
    /// Append to the existing disks array
    Append,
    /// Create the missing part of `domain.devices.disks`
    Create { path: PointerBuf, value: Value },
}

#[derive(Debug, Clone)]
enum Target {
    /// Merge into the user data of an existing cloud-init volume
    Existing {
        path: PointerBuf,
        field_present: bool,
        encoding: Encoding,
        config: Mapping,
    },
    /// Add a `cloudinitdisk` volume
    NewVolume { volumes_present: bool, disk: DiskAction },
}

/// Where and how the boot script goes into the VM template
#[derive(Debug, Clone)]
pub struct CloudInitPlan {
    target: Target,
}

fn conflict(message: impl Into<String>) -> MutationError {
    MutationError::PatchConflict(message.into())
}

fn tokens(parts: &[&str]) -> PointerBuf {
    PointerBuf::from_tokens(parts.iter().copied())
}

/// Inspect the VM object and decide how to inject the boot script.
pub fn plan(vm: &Value) -> Result<CloudInitPlan, MutationError> {
    let template_spec = vm
        .pointer("/spec/template/spec")
        .ok_or_else(|| conflict("VM has no spec.template.spec"))?;
    if !template_spec.is_object() {
        return Err(conflict("spec.template.spec is not an object"));
    }

    let volumes = match template_spec.get("volumes") {
        None | Some(Value::Null) => None,
        Some(Value::Array(volumes)) => Some(volumes),
        Some(_) => return Err(conflict("spec.template.spec.volumes is not a list")),
    };

    if let Some(volumes) = volumes {
        for (index, volume) in volumes.iter().enumerate() {
            let source_key = [NO_CLOUD, CONFIG_DRIVE].into_iter().find(|key| volume.get(*key).is_some());
            match source_key {
                Some(key) => return plan_existing(index, key, &volume[key]),
                None if volume.get("name").and_then(Value::as_str) == Some(CLOUD_INIT_VOLUME) => {
                    return Err(conflict(format!(
                        "volume '{}' exists but is not a cloud-init volume",
                        CLOUD_INIT_VOLUME
                    )));
                }
                None => {}
            }
        }
    }

    Ok(CloudInitPlan {
        target: Target::NewVolume {
            volumes_present: volumes.is_some(),
            disk: plan_disk(template_spec)?,
        },
    })
}

fn plan_existing(index: usize, key: &str, source: &Value) -> Result<CloudInitPlan, MutationError> {
    if !source.is_object() {
        return Err(conflict(format!("volume {} {} is not an object", index, key)));
    }
    let index = index.to_string();

    let (field, encoding, text) = if let Some(data) = source.get("userData") {
        let text = data
            .as_str()
            .ok_or_else(|| conflict(format!("{}.userData is not a string", key)))?;
        ("userData", Encoding::Plain, text.to_string())
    } else if let Some(data) = source.get("userDataBase64") {
        let encoded = data
            .as_str()
            .ok_or_else(|| conflict(format!("{}.userDataBase64 is not a string", key)))?;
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| conflict(format!("{}.userDataBase64 is not valid base64: {}", key, e)))?;
        let text = String::from_utf8(bytes)
            .map_err(|_| conflict(format!("{}.userDataBase64 is not UTF-8 text", key)))?;
        ("userDataBase64", Encoding::Base64, text)
    } else if source.get("secretRef").is_some() || source.get("userDataSecretRef").is_some() {
        return Err(conflict(format!("{} user data comes from a Secret and cannot be merged", key)));
    } else {
        ("userData", Encoding::Plain, String::new())
    };

    let config = parse_cloud_config(&text)?;
    Ok(CloudInitPlan {
        target: Target::Existing {
            path: tokens(&["spec", "template", "spec", "volumes", index.as_str(), key, field]),
            field_present: source.get(field).is_some(),
            encoding,
            config,
        },
    })
}

fn plan_disk(template_spec: &Value) -> Result<DiskAction, MutationError> {
    let disk = json!({"name": CLOUD_INIT_VOLUME, "disk": {"bus": "virtio"}});

    let Some(domain) = template_spec.get("domain").filter(|d| !d.is_null()) else {
        return Ok(DiskAction::Create {
            path: tokens(&["spec", "template", "spec", "domain"]),
            value: json!({"devices": {"disks": [disk]}}),
        });
    };
    if !domain.is_object() {
        return Err(conflict("spec.template.spec.domain is not an object"));
    }

    let Some(devices) = domain.get("devices").filter(|d| !d.is_null()) else {
        return Ok(DiskAction::Create {
            path: tokens(&["spec", "template", "spec", "domain", "devices"]),
            value: json!({"disks": [disk]}),
        });
    };
    if !devices.is_object() {
        return Err(conflict("domain.devices is not an object"));
    }

    match devices.get("disks") {
        None | Some(Value::Null) => Ok(DiskAction::Create {
            path: tokens(&["spec", "template", "spec", "domain", "devices", "disks"]),
            value: json!([disk]),
        }),
        Some(Value::Array(disks)) => {
            let declared = disks
                .iter()
                .any(|d| d.get("name").and_then(Value::as_str) == Some(CLOUD_INIT_VOLUME));
            Ok(if declared { DiskAction::Keep } else { DiskAction::Append })
        }
        Some(_) => Err(conflict("domain.devices.disks is not a list")),
    }
}

/// Parse user data that must be a cloud-config mapping.
///
/// Empty input is an empty cloud-config. The `#cloud-config` header is
/// optional; any other cloud-init format is refused.
pub fn parse_cloud_config(text: &str) -> Result<Mapping, MutationError> {
    let trimmed = text.trim_start();
    if trimmed.is_empty() {
        return Ok(Mapping::new());
    }

    let first_line = trimmed.lines().next().unwrap_or_default().trim_end();
    if first_line.starts_with("#!") {
        return Err(conflict("user data is a shell script, not cloud-config"));
    }
    if first_line.to_ascii_lowercase().starts_with("content-type:") {
        return Err(conflict("user data is a MIME multipart archive"));
    }
    if first_line != CLOUD_CONFIG_HEADER
        && FOREIGN_HEADERS
            .iter()
            .any(|header| first_line.starts_with(header))
    {
        return Err(conflict(format!("user data format '{}' is not supported", first_line)));
    }

    let value: serde_yaml::Value =
        serde_yaml::from_str(text).map_err(|e| conflict(format!("user data is not valid YAML: {}", e)))?;
    let mut config = match value {
        serde_yaml::Value::Null => Mapping::new(),
        serde_yaml::Value::Mapping(mapping) => mapping,
        _ => return Err(conflict("user data is not a cloud-config mapping")),
    };

    match config.get("runcmd") {
        None | Some(serde_yaml::Value::Sequence(_)) => {}
        Some(serde_yaml::Value::Null) => {
            config.remove("runcmd");
        }
        Some(_) => return Err(conflict("cloud-config runcmd is not a list")),
    }
    Ok(config)
}

/// Merge the enrollment keys into `config` and render it with its header.
pub fn render_cloud_config(mut config: Mapping, script: &BootScript) -> Result<String, MutationError> {
    config.insert("hostname".into(), script.hostname.clone().into());
    config.insert("fqdn".into(), script.fqdn.clone().into());
    config.insert("manage_etc_hosts".into(), true.into());

    let mut runcmd = match config.remove("runcmd") {
        Some(serde_yaml::Value::Sequence(commands)) => commands,
        _ => Vec::new(),
    };
    runcmd.extend(script.commands.iter().cloned().map(serde_yaml::Value::from));
    config.insert("runcmd".into(), serde_yaml::Value::Sequence(runcmd));

    let body = serde_yaml::to_string(&config).map_err(|e| conflict(format!("cannot render cloud-config: {}", e)))?;
    Ok(format!("{}\n{}", CLOUD_CONFIG_HEADER, body))
}

impl CloudInitPlan {
    /// Whether an existing cloud-init volume is reused
    #[must_use]
    pub fn merges_existing(&self) -> bool {
        matches!(self.target, Target::Existing { .. })
    }

    /// Patch operations placing `script` into the VM template.
    pub fn patch_operations(&self, script: &BootScript) -> Result<Vec<PatchOperation>, MutationError> {
        match &self.target {
            Target::Existing {
                path,
                field_present,
                encoding,
                config,
            } => {
                let document = render_cloud_config(config.clone(), script)?;
                let value = match encoding {
                    Encoding::Plain => Value::String(document),
                    Encoding::Base64 => Value::String(STANDARD.encode(document)),
                };
                let op = if *field_present {
                    PatchOperation::Replace(ReplaceOperation {
                        path: path.clone(),
                        value,
                    })
                } else {
                    PatchOperation::Add(AddOperation {
                        path: path.clone(),
                        value,
                    })
                };
                Ok(vec![op])
            }
            Target::NewVolume { volumes_present, disk } => {
                let document = render_cloud_config(Mapping::new(), script)?;
                let volume = json!({"name": CLOUD_INIT_VOLUME, NO_CLOUD: {"userData": document}});

                let mut ops = vec![if *volumes_present {
                    PatchOperation::Add(AddOperation {
                        path: tokens(&["spec", "template", "spec", "volumes", "-"]),
                        value: volume,
                    })
                } else {
                    PatchOperation::Add(AddOperation {
                        path: tokens(&["spec", "template", "spec", "volumes"]),
                        value: json!([volume]),
                    })
                }];

                match disk {
                    DiskAction::Keep => {}
                    DiskAction::Append => ops.push(PatchOperation::Add(AddOperation {
                        path: tokens(&["spec", "template", "spec", "domain", "devices", "disks", "-"]),
                        value: json!({"name": CLOUD_INIT_VOLUME, "disk": {"bus": "virtio"}}),
                    })),
                    DiskAction::Create { path, value } => ops.push(PatchOperation::Add(AddOperation {
                        path: path.clone(),
                        value: value.clone(),
                    })),
                }
                Ok(ops)
            }
        }
    }
}
