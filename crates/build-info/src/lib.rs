use once_cell::sync::Lazy;

#[derive(Debug)]
struct BuildMeta {
    build_id: String,
    git_label: String,
}

impl BuildMeta {
    fn collect() -> Self {
        Self {
            build_id: option_env!("DEVFLEET_BUILD_ID")
                .unwrap_or("unknown build")
                .to_string(),
            git_label: option_env!("DEVFLEET_BUILD_GIT")
                .unwrap_or("unknown git")
                .to_string(),
        }
    }
}

static META: Lazy<BuildMeta> = Lazy::new(BuildMeta::collect);

/// Full build identifier, e.g. "2026-10-18 09:12:44 UTC | v0.1.0-3-gdeadbee".
pub fn build_id() -> &'static str {
    META.build_id.as_str()
}

/// Git tag/commit detected at build time.
pub fn git_label() -> &'static str {
    META.git_label.as_str()
}

/// Banner printed by the daemon and `devfleetd status`.
pub fn formatted_banner(package: &str, version: &str) -> String {
    format!("{} {} | {}", package, version, build_id())
}
