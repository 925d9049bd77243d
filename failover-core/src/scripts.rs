//! Resource and notification script commands
//!
//! Builds the command lines for every external action. Resource actions go
//! through the resource manager entry point (`listkeys`, `ourkeys`,
//! `otherkeys`, `allkeys`, `takegroup`, `givegroup`). The key loop runs in
//! `sh` so the engine only tracks a single child per action.

use crate::abstractions::CommandSpec;
use crate::config::ScriptConfig;
use crate::error::{FailoverError, FailoverResult};
use crate::message::Envelope;
use crate::resource::ResourceClass;

const ENV_RSC_MGR: &str = "HA_RSC_MGR";
const ENV_CURHOST: &str = "HA_CURHOST";
const ENV_DONTASK: &str = "HA_DONTASK";
const ENV_NICEFAILBACK: &str = "HA_NICEFAILBACK";
const ENV_OSTATUS: &str = "HA_OSTATUS";
const ENV_RSC_BEFORE: &str = "HA_RSC_BEFORE";

/// Which half of a standby hand-off we run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StandbySide {
    /// We asked to go standby and give our share away
    Release,
    /// The peer asked and we take its share
    Acquire,
}

impl StandbySide {
    fn verb(self) -> &'static str {
        match self {
            StandbySide::Release => "givegroup",
            StandbySide::Acquire => "takegroup",
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            StandbySide::Release => "give up",
            StandbySide::Acquire => "acquire",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScriptCommands {
    scripts: ScriptConfig,
    node_name: String,
    nice_failback: bool,
}

impl ScriptCommands {
    pub fn new(scripts: ScriptConfig, node_name: impl Into<String>, nice_failback: bool) -> Self {
        Self {
            scripts,
            node_name: node_name.into(),
            nice_failback,
        }
    }

    fn key_loop(&self, query: &str, verb: &str) -> CommandSpec {
        let script = format!(
            "rc=0; for key in $(\"${mgr}\" {query}); do \"${mgr}\" {verb} \"$key\" || rc=1; done; exit $rc",
            mgr = ENV_RSC_MGR,
            query = query,
            verb = verb,
        );
        CommandSpec::shell(script)
            .with_env_var(ENV_RSC_MGR, self.scripts.resource_manager.display().to_string())
            .with_env_var(ENV_CURHOST, self.node_name.as_str())
    }

    /// Acquire every group configured for this node
    pub fn acquire_local(&self, alone: bool) -> CommandSpec {
        let mut cmd = self.key_loop(&format!("listkeys \"${}\"", ENV_CURHOST), "takegroup");
        if alone {
            cmd = cmd.with_env_var(ENV_DONTASK, "yes");
        }
        if self.nice_failback {
            cmd = cmd.with_env_var(ENV_NICEFAILBACK, "yes");
        }
        cmd
    }

    /// Release or take the groups covered by a standby `scope`
    pub fn standby(&self, side: StandbySide, scope: ResourceClass) -> FailoverResult<CommandSpec> {
        // scope is relative to the requester; the acquirer acts on the
        // mirror image
        let act_on = match side {
            StandbySide::Release => scope,
            StandbySide::Acquire => scope.flip(),
        };
        let query = match act_on {
            ResourceClass::Local => "ourkeys",
            ResourceClass::Foreign => "otherkeys",
            ResourceClass::All => "allkeys",
            ResourceClass::None => {
                return Err(FailoverError::invalid_operation(
                    "standby",
                    format!("no resources to {}", side.describe()),
                ))
            }
        };
        Ok(self.key_loop(query, side.verb()))
    }

    /// Release every group this node might hold
    pub fn give_up_all(&self) -> CommandSpec {
        self.key_loop("listkeys '.*'", "givegroup")
    }

    /// Notification script invocation for a processed message
    pub fn notify(&self, envelope: &Envelope, old_status: &str, held_before: ResourceClass) -> CommandSpec {
        let record = envelope.to_record();
        let mut cmd = CommandSpec::new(&self.scripts.notify_script)
            .with_arg(envelope.message.type_name().to_ascii_lowercase())
            .with_env_var(ENV_CURHOST, self.node_name.as_str())
            .with_env_var(ENV_OSTATUS, old_status)
            .with_env_var(ENV_RSC_BEFORE, held_before.as_str());
        for (field, value) in record.iter() {
            cmd = cmd.with_env_var(format!("HA_{}", field), value);
        }
        if self.nice_failback {
            cmd = cmd.with_env_var(ENV_NICEFAILBACK, "yes");
        }
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ClusterMessage;
    use std::path::PathBuf;

    fn commands() -> ScriptCommands {
        ScriptCommands::new(
            ScriptConfig {
                resource_manager: PathBuf::from("/usr/lib/ha/ResourceManager"),
                notify_script: PathBuf::from("/etc/ha.d/harc"),
                notify_dir: PathBuf::from("/etc/ha.d/rc.d"),
            },
            "alpha",
            true,
        )
    }

    #[test]
    fn test_acquire_local_environment() {
        let cmd = commands().acquire_local(true);
        assert_eq!(cmd.program, PathBuf::from("/bin/sh"));
        assert!(cmd.args[1].contains("listkeys \"$HA_CURHOST\""));
        assert!(cmd.args[1].contains("takegroup"));
        assert_eq!(cmd.env.get("HA_DONTASK").map(String::as_str), Some("yes"));
        assert_eq!(cmd.env.get("HA_NICEFAILBACK").map(String::as_str), Some("yes"));
        assert_eq!(cmd.env.get("HA_CURHOST").map(String::as_str), Some("alpha"));

        let asked = commands().acquire_local(false);
        assert!(!asked.env.contains_key("HA_DONTASK"));
    }

    #[test]
    fn test_standby_queries_mirror_scope() {
        let c = commands();
        let release = c.standby(StandbySide::Release, ResourceClass::Local).unwrap();
        assert!(release.args[1].contains("ourkeys"));
        assert!(release.args[1].contains("givegroup"));

        let acquire = c.standby(StandbySide::Acquire, ResourceClass::Local).unwrap();
        assert!(acquire.args[1].contains("otherkeys"));
        assert!(acquire.args[1].contains("takegroup"));

        let all = c.standby(StandbySide::Acquire, ResourceClass::All).unwrap();
        assert!(all.args[1].contains("allkeys"));

        assert!(c.standby(StandbySide::Release, ResourceClass::None).is_err());
    }

    #[test]
    fn test_give_up_all() {
        let cmd = commands().give_up_all();
        assert!(cmd.args[1].contains("listkeys '.*'"));
        assert!(cmd.args[1].contains("givegroup"));
    }

    #[test]
    fn test_notify_exports_fields() {
        let env = Envelope::new("beta", ClusterMessage::node_dead(false));
        let cmd = commands().notify(&env, "active", ResourceClass::Local);

        assert_eq!(cmd.program, PathBuf::from("/etc/ha.d/harc"));
        assert_eq!(cmd.args, vec!["status".to_string()]);
        assert_eq!(cmd.env.get("HA_t").map(String::as_str), Some("status"));
        assert_eq!(cmd.env.get("HA_src").map(String::as_str), Some("beta"));
        assert_eq!(cmd.env.get("HA_st").map(String::as_str), Some("dead"));
        assert_eq!(cmd.env.get("HA_OSTATUS").map(String::as_str), Some("active"));
        assert_eq!(cmd.env.get("HA_RSC_BEFORE").map(String::as_str), Some("local"));
    }

    #[test]
    fn test_notify_passes_transport_fields_through() {
        let raw: crate::message::RawMessage = [
            ("t", "status"),
            ("src", "beta"),
            ("st", "active"),
            ("ts", "65a1b2c3"),
            ("seq", "42"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let env = Envelope::decode(raw).unwrap();
        let cmd = commands().notify(&env, "active", ResourceClass::None);

        assert_eq!(cmd.env.get("HA_ts").map(String::as_str), Some("65a1b2c3"));
        assert_eq!(cmd.env.get("HA_seq").map(String::as_str), Some("42"));
        assert_eq!(cmd.env.get("HA_st").map(String::as_str), Some("active"));
    }
}
