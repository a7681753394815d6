use serde::{Deserialize, Serialize};

/// Fixed lookup lists for platform-provided release metadata, checked in
/// order after the `AIVORY_*` variables.
const COMMIT_VARS: &[&str] = &[
    "HEROKU_SLUG_COMMIT",
    "VERCEL_GIT_COMMIT_SHA",
    "CIRCLE_SHA1",
    "GITHUB_SHA",
    "CI_COMMIT_SHA",
];
const BRANCH_VARS: &[&str] = &[
    "VERCEL_GIT_COMMIT_REF",
    "CIRCLE_BRANCH",
    "GITHUB_REF_NAME",
    "CI_COMMIT_REF_NAME",
];
const REPOSITORY_VARS: &[&str] = &[
    "CIRCLE_PROJECT_REPONAME",
    "GITHUB_REPOSITORY",
    "CI_PROJECT_PATH",
];
const VERSION_VARS: &[&str] = &["APP_VERSION", "npm_package_version"];

/// Release metadata attached to the registration payload and to every
/// outbound capture. Computed once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
}

impl ReleaseRecord {
    fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.version.is_none()
            && self.commit.is_none()
            && self.branch.is_none()
            && self.repository.is_none()
    }
}

/// Explicit release fields supplied through `init`. Each field overrides the
/// matching environment lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseOptions {
    pub release: Option<String>,
    pub version: Option<String>,
    pub commit: Option<String>,
    pub branch: Option<String>,
    pub repository: Option<String>,
}

/// Resolve the release record from explicit options, `AIVORY_*` variables,
/// and platform CI variables, in that order. Returns `None` when nothing
/// resolves.
pub fn resolve(options: &ReleaseOptions) -> Option<ReleaseRecord> {
    resolve_with(options, &|name| std::env::var(name).ok())
}

/// Same cascade with an injected environment lookup.
pub fn resolve_with(
    options: &ReleaseOptions,
    env: &dyn Fn(&str) -> Option<String>,
) -> Option<ReleaseRecord> {
    let mut record = ReleaseRecord::default();

    let release_string = options
        .release
        .clone()
        .or_else(|| non_empty(env("AIVORY_RELEASE")));
    if let Some(raw) = release_string {
        apply_release_string(&mut record, raw.trim());
    }

    fill(&mut record.version, &options.version, "AIVORY_VERSION", VERSION_VARS, env);
    fill(&mut record.commit, &options.commit, "AIVORY_COMMIT", COMMIT_VARS, env);
    fill(&mut record.branch, &options.branch, "AIVORY_BRANCH", BRANCH_VARS, env);
    fill(
        &mut record.repository,
        &options.repository,
        "AIVORY_REPOSITORY",
        REPOSITORY_VARS,
        env,
    );

    if record.repository.is_none() {
        record.repository = vercel_repository(env);
    }

    if record.is_empty() {
        None
    } else {
        Some(record)
    }
}

/// `name@ver` splits into name and version; a bare 7-40 char hex string is a
/// commit; anything else is a release name.
fn apply_release_string(record: &mut ReleaseRecord, raw: &str) {
    if raw.is_empty() {
        return;
    }
    if let Some((name, version)) = raw.split_once('@') {
        if !name.is_empty() && !version.is_empty() {
            record.name = Some(name.to_string());
            record.version = Some(version.to_string());
            return;
        }
    }
    if looks_like_commit(raw) {
        record.commit = Some(raw.to_string());
    } else {
        record.name = Some(raw.to_string());
    }
}

fn looks_like_commit(raw: &str) -> bool {
    (7..=40).contains(&raw.len()) && raw.chars().all(|ch| ch.is_ascii_hexdigit())
}

fn fill(
    slot: &mut Option<String>,
    explicit: &Option<String>,
    aivory_var: &str,
    platform_vars: &[&str],
    env: &dyn Fn(&str) -> Option<String>,
) {
    if let Some(value) = explicit {
        *slot = Some(value.clone());
        return;
    }
    if slot.is_some() {
        return;
    }
    if let Some(value) = non_empty(env(aivory_var)) {
        *slot = Some(value);
        return;
    }
    for name in platform_vars {
        if let Some(value) = non_empty(env(name)) {
            *slot = Some(value);
            return;
        }
    }
}

/// Vercel splits the repository across owner and slug.
fn vercel_repository(env: &dyn Fn(&str) -> Option<String>) -> Option<String> {
    let owner = non_empty(env("VERCEL_GIT_REPO_OWNER"))?;
    let slug = non_empty(env("VERCEL_GIT_REPO_SLUG"))?;
    Some(format!("{owner}/{slug}"))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn nothing_resolves_to_absent_record() {
        let env = env_of(&[]);
        assert_eq!(resolve_with(&ReleaseOptions::default(), &env), None);
    }

    #[test]
    fn release_string_splits_name_and_version() {
        let env = env_of(&[("AIVORY_RELEASE", "checkout@2.4.1")]);
        let record = resolve_with(&ReleaseOptions::default(), &env).expect("record");
        assert_eq!(record.name.as_deref(), Some("checkout"));
        assert_eq!(record.version.as_deref(), Some("2.4.1"));
    }

    #[test]
    fn hex_release_string_is_a_commit() {
        let env = env_of(&[("AIVORY_RELEASE", "deadbeefcafe1234")]);
        let record = resolve_with(&ReleaseOptions::default(), &env).expect("record");
        assert_eq!(record.commit.as_deref(), Some("deadbeefcafe1234"));
        assert_eq!(record.name, None);
    }

    #[test]
    fn short_hex_is_a_name_not_a_commit() {
        let env = env_of(&[("AIVORY_RELEASE", "abc123")]);
        let record = resolve_with(&ReleaseOptions::default(), &env).expect("record");
        assert_eq!(record.name.as_deref(), Some("abc123"));
        assert_eq!(record.commit, None);
    }

    #[test]
    fn explicit_options_beat_environment() {
        let env = env_of(&[("AIVORY_COMMIT", "envcommit1234"), ("GITHUB_SHA", "ghsha567890")]);
        let options = ReleaseOptions {
            commit: Some("explicit9999999".to_string()),
            ..ReleaseOptions::default()
        };
        let record = resolve_with(&options, &env).expect("record");
        assert_eq!(record.commit.as_deref(), Some("explicit9999999"));
    }

    #[test]
    fn platform_variables_fill_remaining_fields() {
        let env = env_of(&[
            ("GITHUB_SHA", "1234567890abcdef1234"),
            ("GITHUB_REF_NAME", "main"),
            ("GITHUB_REPOSITORY", "aivory/checkout"),
            ("npm_package_version", "1.0.3"),
        ]);
        let record = resolve_with(&ReleaseOptions::default(), &env).expect("record");
        assert_eq!(record.commit.as_deref(), Some("1234567890abcdef1234"));
        assert_eq!(record.branch.as_deref(), Some("main"));
        assert_eq!(record.repository.as_deref(), Some("aivory/checkout"));
        assert_eq!(record.version.as_deref(), Some("1.0.3"));
    }

    #[test]
    fn vercel_repository_combines_owner_and_slug() {
        let env = env_of(&[
            ("VERCEL_GIT_REPO_OWNER", "aivory"),
            ("VERCEL_GIT_REPO_SLUG", "storefront"),
        ]);
        let record = resolve_with(&ReleaseOptions::default(), &env).expect("record");
        assert_eq!(record.repository.as_deref(), Some("aivory/storefront"));
    }

    #[test]
    fn aivory_variables_beat_platform_variables() {
        let env = env_of(&[
            ("AIVORY_BRANCH", "release/2.4"),
            ("CIRCLE_BRANCH", "trunk"),
        ]);
        let record = resolve_with(&ReleaseOptions::default(), &env).expect("record");
        assert_eq!(record.branch.as_deref(), Some("release/2.4"));
    }
}
