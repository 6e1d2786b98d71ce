//! Script transport for the `run_script` operation
//!
//! Source code is base64-encoded so it survives shell quoting untouched, then
//! decoded and executed by the target interpreter on the sandbox host.
//! Only what the script prints to stdout comes back.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Interpreter a script is executed with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptRuntime {
    Python,
    Node,
    Shell,
}

impl ScriptRuntime {
    pub fn name(self) -> &'static str {
        match self {
            ScriptRuntime::Python => "python3",
            ScriptRuntime::Node => "node",
            ScriptRuntime::Shell => "sh",
        }
    }

    /// Shell command that decodes and runs `code`
    pub fn command_for(self, code: &str) -> String {
        let encoded = STANDARD.encode(code.as_bytes());
        match self {
            ScriptRuntime::Python => format!(
                "python3 -c \"import base64; exec(base64.b64decode('{}').decode())\"",
                encoded
            ),
            ScriptRuntime::Node => format!(
                "node -e \"eval(Buffer.from('{}', 'base64').toString())\"",
                encoded
            ),
            ScriptRuntime::Shell => format!("printf '%s' '{}' | base64 -d | sh", encoded),
        }
    }
}

impl std::str::FromStr for ScriptRuntime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "python" | "python3" => Ok(ScriptRuntime::Python),
            "javascript" | "node" => Ok(ScriptRuntime::Node),
            "bash" | "sh" | "shell" => Ok(ScriptRuntime::Shell),
            other => Err(format!(
                "Unsupported runtime: {}. Supported: python, node, sh",
                other
            )),
        }
    }
}
