//! QMP message types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Well-known command names.
pub mod commands {
    /// Capabilities negotiation, sent once per connection before anything else.
    pub const CAPABILITIES: &str = "qmp_capabilities";
    /// Reports the run state of the guest.
    pub const QUERY_STATUS: &str = "query-status";
    /// ACPI power-button press (graceful shutdown request).
    pub const SYSTEM_POWERDOWN: &str = "system_powerdown";
    /// Hard reset of the guest.
    pub const SYSTEM_RESET: &str = "system_reset";
    /// Pauses all vCPUs.
    pub const STOP: &str = "stop";
    /// Resumes all vCPUs.
    pub const CONT: &str = "cont";
    /// Runs a human monitor (HMP) command line.
    pub const HUMAN_MONITOR: &str = "human-monitor-command";
}

/// A client → server command: `{"execute": <name>, "arguments": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Command {
    /// Command name.
    pub execute: String,
    /// Command arguments, omitted from the wire when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Map<String, Value>>,
}

impl Command {
    /// Creates a command with no arguments.
    pub fn new(execute: impl Into<String>) -> Self {
        Self {
            execute: execute.into(),
            arguments: None,
        }
    }

    /// Adds one argument.
    #[must_use]
    pub fn arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    /// Builds an HMP passthrough, e.g. `savevm <tag>`.
    pub fn human(command_line: impl Into<String>) -> Self {
        Self::new(commands::HUMAN_MONITOR).arg("command-line", command_line.into())
    }

    /// Parses user input: either a bare command name or a JSON command object.
    ///
    /// `"query-status"` and `{"execute": "query-status"}` are equivalent.
    pub fn parse(input: &str) -> crate::Result<Self> {
        let input = input.trim();
        if input.starts_with('{') {
            Ok(serde_json::from_str(input)?)
        } else {
            Ok(Self::new(input))
        }
    }
}

/// The server banner sent on connect: `{"QMP": {"version": ..., "capabilities": [...]}}`.
#[derive(Debug, Clone, Deserialize)]
#[non_exhaustive]
pub struct Greeting {
    /// Banner body.
    #[serde(rename = "QMP")]
    pub qmp: GreetingBody,
}

/// Contents of the [`Greeting`] banner.
#[derive(Debug, Clone, Deserialize)]
#[non_exhaustive]
pub struct GreetingBody {
    /// Server version information.
    #[serde(default)]
    pub version: Option<GreetingVersion>,
    /// Optional protocol capabilities the server offers.
    #[serde(default)]
    pub capabilities: Vec<Value>,
}

/// Version block of the greeting.
#[derive(Debug, Clone, Deserialize)]
#[non_exhaustive]
pub struct GreetingVersion {
    /// Upstream QEMU version triple.
    pub qemu: QemuVersion,
    /// Distribution package string.
    #[serde(default)]
    pub package: String,
}

/// A QEMU `major.minor.micro` version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[non_exhaustive]
pub struct QemuVersion {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
    /// Micro version.
    pub micro: u32,
}

impl std::fmt::Display for QemuVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}

impl Greeting {
    /// Interprets a received line as a greeting, if it is one.
    pub fn from_value(v: &Value) -> Option<Self> {
        serde_json::from_value(v.clone()).ok()
    }

    /// Returns the server's QEMU version, when advertised.
    pub fn qemu_version(&self) -> Option<QemuVersion> {
        self.qmp.version.as_ref().map(|v| v.qemu)
    }
}

/// Returns `true` if the message is an asynchronous event rather than a reply.
pub fn is_event(v: &Value) -> bool {
    v.get("event").is_some()
}

/// Extracts `(class, desc)` from an error reply.
pub fn error_of(v: &Value) -> Option<(String, String)> {
    let err = v.get("error")?;
    let class = err
        .get("class")
        .and_then(Value::as_str)
        .unwrap_or("GenericError");
    let desc = err.get("desc").and_then(Value::as_str).unwrap_or_default();
    Some((class.to_owned(), desc.to_owned()))
}
