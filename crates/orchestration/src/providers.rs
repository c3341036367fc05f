//! Agent CLI providers.
//!
//! A provider only knows how to build the command line for its CLI and how
//! to frame text for its stdin. Spawning, stopping and output capture belong
//! to the process supervisor.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use devfleet_common::config::ProviderSection;
use devfleet_supervisor::CommandSpec;
use serde_json::json;

use crate::types::AgentProviderKind;

/// Inputs available when a provider builds its command.
#[derive(Clone, Debug, Default)]
pub struct ProviderContext {
    pub working_dir: Option<PathBuf>,
    /// Resolved credentials, keyed by variable name.
    pub credentials: BTreeMap<String, String>,
    /// Folder environment from preferences.
    pub env: BTreeMap<String, String>,
}

pub trait AgentProvider: Send + Sync {
    fn kind(&self) -> AgentProviderKind;

    fn command(&self, ctx: &ProviderContext) -> CommandSpec;

    /// Environment variables holding the credentials this CLI reads.
    fn credential_vars(&self) -> &[&'static str];

    /// Frame `text` as one stdin message.
    fn encode_input(&self, text: &str) -> String {
        text.to_string()
    }
}

/// Command line shared by every provider, overridable from configuration.
#[derive(Clone, Debug)]
struct Invocation {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

impl Invocation {
    fn defaults(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: BTreeMap::new(),
        }
    }

    fn apply(mut self, section: Option<&ProviderSection>) -> Self {
        if let Some(section) = section {
            if let Some(program) = section.program.as_ref().filter(|p| !p.trim().is_empty()) {
                self.program = program.clone();
            }
            if let Some(args) = &section.args {
                self.args = args.clone();
            }
            self.env.extend(section.env.clone());
        }
        self
    }

    fn build(&self, ctx: &ProviderContext) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.program);
        spec.args = self.args.clone();
        spec.env.extend(ctx.env.clone());
        spec.env.extend(self.env.clone());
        spec.env.extend(ctx.credentials.clone());
        spec
    }
}

pub struct ClaudeProvider {
    invocation: Invocation,
}

impl ClaudeProvider {
    fn new(section: Option<&ProviderSection>) -> Self {
        let invocation = Invocation::defaults(
            "claude",
            &[
                "--print",
                "--input-format",
                "stream-json",
                "--output-format",
                "stream-json",
                "--verbose",
            ],
        )
        .apply(section);
        Self { invocation }
    }

    fn stream_json(&self) -> bool {
        self.invocation
            .args
            .windows(2)
            .any(|pair| pair[0] == "--input-format" && pair[1] == "stream-json")
    }
}

impl AgentProvider for ClaudeProvider {
    fn kind(&self) -> AgentProviderKind {
        AgentProviderKind::Claude
    }

    fn command(&self, ctx: &ProviderContext) -> CommandSpec {
        self.invocation.build(ctx)
    }

    fn credential_vars(&self) -> &[&'static str] {
        &["ANTHROPIC_API_KEY"]
    }

    fn encode_input(&self, text: &str) -> String {
        if !self.stream_json() {
            return text.to_string();
        }
        json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": [{ "type": "text", "text": text }],
            }
        })
        .to_string()
    }
}

/// Providers whose CLI reads a plain prompt from stdin.
pub struct PlainProvider {
    kind: AgentProviderKind,
    invocation: Invocation,
    credentials: &'static [&'static str],
}

impl AgentProvider for PlainProvider {
    fn kind(&self) -> AgentProviderKind {
        self.kind
    }

    fn command(&self, ctx: &ProviderContext) -> CommandSpec {
        self.invocation.build(ctx)
    }

    fn credential_vars(&self) -> &[&'static str] {
        self.credentials
    }
}

#[derive(Clone)]
pub struct ProviderRegistry {
    providers: BTreeMap<AgentProviderKind, Arc<dyn AgentProvider>>,
}

impl ProviderRegistry {
    /// Built-in providers with overrides from `[providers.<name>]`.
    pub fn from_config(sections: &BTreeMap<String, ProviderSection>) -> Self {
        let section = |kind: AgentProviderKind| sections.get(kind.as_str());

        let mut providers: BTreeMap<AgentProviderKind, Arc<dyn AgentProvider>> = BTreeMap::new();
        providers.insert(
            AgentProviderKind::Claude,
            Arc::new(ClaudeProvider::new(section(AgentProviderKind::Claude))),
        );
        providers.insert(
            AgentProviderKind::Codex,
            Arc::new(PlainProvider {
                kind: AgentProviderKind::Codex,
                invocation: Invocation::defaults("codex", &["exec", "--json", "-"])
                    .apply(section(AgentProviderKind::Codex)),
                credentials: &["OPENAI_API_KEY"],
            }),
        );
        providers.insert(
            AgentProviderKind::Gemini,
            Arc::new(PlainProvider {
                kind: AgentProviderKind::Gemini,
                invocation: Invocation::defaults("gemini", &[])
                    .apply(section(AgentProviderKind::Gemini)),
                credentials: &["GEMINI_API_KEY"],
            }),
        );
        providers.insert(
            AgentProviderKind::OpenCode,
            Arc::new(PlainProvider {
                kind: AgentProviderKind::OpenCode,
                invocation: Invocation::defaults("opencode", &["run"])
                    .apply(section(AgentProviderKind::OpenCode)),
                credentials: &[],
            }),
        );
        Self { providers }
    }

    pub fn get(&self, kind: AgentProviderKind) -> Option<Arc<dyn AgentProvider>> {
        self.providers.get(&kind).cloned()
    }

    pub fn register(&mut self, provider: Arc<dyn AgentProvider>) {
        self.providers.insert(provider.kind(), provider);
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::from_config(&BTreeMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_wraps_input_as_stream_json() {
        let registry = ProviderRegistry::default();
        let claude = registry.get(AgentProviderKind::Claude).unwrap();
        let line = claude.encode_input("fix the build");
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "user");
        assert_eq!(value["message"]["content"][0]["text"], "fix the build");
    }

    #[test]
    fn overrides_replace_program_and_args() {
        let mut sections = BTreeMap::new();
        sections.insert(
            "claude".to_string(),
            ProviderSection {
                program: Some("/opt/claude".into()),
                args: Some(vec!["--print".into()]),
                env: BTreeMap::from([("CLAUDE_MODE".to_string(), "ci".to_string())]),
            },
        );
        let registry = ProviderRegistry::from_config(&sections);
        let claude = registry.get(AgentProviderKind::Claude).unwrap();

        let ctx = ProviderContext {
            credentials: BTreeMap::from([("ANTHROPIC_API_KEY".to_string(), "k".to_string())]),
            ..ProviderContext::default()
        };
        let spec = claude.command(&ctx);
        assert_eq!(spec.program, "/opt/claude");
        assert_eq!(spec.args, vec!["--print"]);
        assert_eq!(spec.env.get("CLAUDE_MODE").map(String::as_str), Some("ci"));
        assert_eq!(spec.env.get("ANTHROPIC_API_KEY").map(String::as_str), Some("k"));
        // Without stream-json input the prompt is sent as plain text.
        assert_eq!(claude.encode_input("hi"), "hi");
    }

    #[test]
    fn every_kind_is_registered() {
        let registry = ProviderRegistry::default();
        for kind in AgentProviderKind::ALL {
            assert_eq!(registry.get(kind).unwrap().kind(), kind);
        }
        let codex = registry.get(AgentProviderKind::Codex).unwrap();
        assert_eq!(codex.credential_vars(), &["OPENAI_API_KEY"]);
        assert_eq!(
            codex.command(&ProviderContext::default()).display_line(),
            "codex exec --json -"
        );
    }
}
