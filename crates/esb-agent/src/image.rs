// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker image references.
//!
//! A function named `My Func` for brand `acme` runs image
//! `[<registry>/]acme-my-func:<tag>`. The tag comes from `<ACME>_TAG`, then
//! `ESB_TAG`, then `latest`.
//!
//! The module also carries the runtime observation helpers: reading tags from
//! refs, inferring the runtime mode from image naming, and rewriting floating
//! base-image refs to the observed version.

use std::fmt;

use thiserror::Error;

use crate::identity::Identity;

/// Base image repository whose floating tag follows the running stack.
pub const LAMBDA_BASE_REPOSITORY: &str = "esb-lambda-base";

/// Image resolution and runtime compatibility errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ImageError {
    /// Empty function name.
    #[error("function name is required")]
    EmptyFunctionName,

    /// The function name sanitizes to nothing.
    #[error("function name {0:?} yields empty image name")]
    EmptyImageName(String),

    /// Strict runtime mode check failed.
    #[error("runtime mode mismatch: expected {expected:?}, observed {observed:?}")]
    ModeMismatch {
        /// Required mode.
        expected: String,
        /// Observed mode.
        observed: String,
    },
}

/// Sanitize a function name into an image name component.
pub fn sanitize(name: &str) -> Result<String, ImageError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ImageError::EmptyFunctionName);
    }
    let mut out = String::with_capacity(trimmed.len());
    let mut prev_separator = false;
    for c in trimmed.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
            prev_separator = false;
        } else if !prev_separator {
            out.push(if matches!(c, '.' | '_' | '-') { c } else { '-' });
            prev_separator = true;
        }
    }
    let result = out.trim_matches(|c| matches!(c, '.' | '_' | '-'));
    if result.is_empty() {
        return Err(ImageError::EmptyImageName(name.to_string()));
    }
    Ok(result.to_string())
}

/// Resolve the worker image tag: `<ENV_PREFIX>_TAG`, `ESB_TAG`, `latest`.
pub fn resolve_tag<F>(identity: &Identity, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
    non_empty(&format!("{}_TAG", identity.env_prefix()))
        .or_else(|| non_empty("ESB_TAG"))
        .unwrap_or_else(|| "latest".to_string())
}

/// Builds worker image refs.
#[derive(Debug, Clone)]
pub struct ImageResolver {
    prefix: String,
    registry: Option<String>,
    tag: String,
    observation: Option<RuntimeObservation>,
}

impl ImageResolver {
    /// Create a resolver. `prefix` defaults to the brand slug.
    pub fn new(identity: &Identity, registry: Option<String>, prefix: Option<String>, tag: String) -> Self {
        let prefix = prefix
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| identity.container_prefix().to_string());
        let registry = registry
            .map(|r| r.trim().trim_end_matches('/').to_string())
            .filter(|r| !r.is_empty());
        Self {
            prefix,
            registry,
            tag,
            observation: None,
        }
    }

    /// Attach the runtime observation used for base-image rewriting.
    pub fn with_observation(mut self, observation: RuntimeObservation) -> Self {
        self.observation = Some(observation);
        self
    }

    /// The tag applied to function images.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Configured registry without trailing slash.
    pub fn registry(&self) -> Option<&str> {
        self.registry.as_deref()
    }

    /// `<prefix>-<sanitized function>`
    pub fn image_name(&self, function: &str) -> Result<String, ImageError> {
        Ok(format!("{}-{}", self.prefix, sanitize(function)?))
    }

    /// Full ref for `function`.
    pub fn function_image(&self, function: &str) -> Result<String, ImageError> {
        let name = self.image_name(function)?;
        Ok(match &self.registry {
            Some(registry) => format!("{registry}/{name}:{}", self.tag),
            None => format!("{name}:{}", self.tag),
        })
    }

    /// The explicit image when given (base tag rewritten to the observed
    /// version), otherwise the function image.
    pub fn resolve(&self, function: &str, explicit: Option<&str>) -> Result<String, ImageError> {
        match explicit.map(str::trim).filter(|s| !s.is_empty()) {
            Some(image) => Ok(match &self.observation {
                Some(obs) => rewrite_base_tag(image, &obs.version_tag)
                    .unwrap_or_else(|| image.to_string()),
                None => image.to_string(),
            }),
            None => self.function_image(function),
        }
    }
}

/// Runtime flavour of the running stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    /// Container daemon.
    Daemon,
    /// Container supervisor.
    Supervisor,
}

impl RuntimeMode {
    /// Accepts `docker`/`daemon` and `containerd`/`supervisor`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "docker" | "daemon" => Some(Self::Daemon),
            "containerd" | "supervisor" => Some(Self::Supervisor),
            _ => None,
        }
    }

    /// Canonical name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daemon => "docker",
            Self::Supervisor => "containerd",
        }
    }
}

impl fmt::Display for RuntimeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the running stack looks like. Advisory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeObservation {
    /// Observed mode.
    pub mode: Option<RuntimeMode>,
    /// Observed version tag.
    pub version_tag: String,
    /// Where the observation came from.
    pub source: String,
}

/// What an artifact declares it needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeRequirement {
    /// Required mode.
    pub mode: Option<RuntimeMode>,
    /// Expected version tag.
    pub version_tag: Option<String>,
    /// Fail instead of warn on mode mismatch.
    pub strict: bool,
}

/// Tag of an image ref. Digests are ignored and a registry port is not a tag.
pub fn parse_tag(image_ref: &str) -> Option<&str> {
    let without_digest = image_ref.trim().split('@').next().unwrap_or_default();
    let slash = without_digest.rfind('/');
    let colon = without_digest.rfind(':')?;
    if slash.is_some_and(|s| colon < s) || colon + 1 >= without_digest.len() {
        return None;
    }
    Some(without_digest[colon + 1..].trim())
}

/// Infer the runtime mode from image naming. A `-containerd:` ref wins over
/// any number of `-docker:` refs.
pub fn infer_mode<'a, I>(image_refs: I) -> Option<RuntimeMode>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut found_daemon = false;
    for image_ref in image_refs {
        let trimmed = image_ref.trim();
        if trimmed.contains("-containerd:") {
            return Some(RuntimeMode::Supervisor);
        }
        if trimmed.contains("-docker:") {
            found_daemon = true;
        }
    }
    found_daemon.then_some(RuntimeMode::Daemon)
}

/// Rewrite a floating `esb-lambda-base` ref to `tag`. Returns `None` when the
/// ref is left unchanged: another repository, a pinned tag, or a digest.
pub fn rewrite_base_tag(image_ref: &str, tag: &str) -> Option<String> {
    let tag = tag.trim();
    let trimmed = image_ref.trim();
    if tag.is_empty() || trimmed.is_empty() || trimmed.contains('@') {
        return None;
    }
    let slash = trimmed.rfind('/');
    let (repo, current) = match trimmed.rfind(':') {
        Some(colon) if slash.is_none_or(|s| colon > s) => {
            (&trimmed[..colon], Some(&trimmed[colon + 1..]))
        }
        _ => (trimmed, None),
    };
    let last_segment = repo.rsplit('/').next().unwrap_or(repo);
    if last_segment != LAMBDA_BASE_REPOSITORY {
        return None;
    }
    if let Some(current) = current
        && !current.is_empty()
        && current != "latest"
    {
        return None;
    }
    Some(format!("{repo}:{tag}"))
}

/// Compare an observation with a requirement. Returns warnings, or an error
/// on a strict mode mismatch.
pub fn check_requirement(
    requirement: &RuntimeRequirement,
    observation: Option<&RuntimeObservation>,
) -> Result<Vec<String>, ImageError> {
    let mut warnings = Vec::new();
    if requirement.mode.is_none() && requirement.version_tag.is_none() {
        return Ok(warnings);
    }
    let Some(obs) = observation else {
        warnings.push("runtime observation is required when a runtime requirement is set".to_string());
        return Ok(warnings);
    };

    if let Some(expected) = requirement.mode {
        match obs.mode {
            None => warnings.push(format!(
                "runtime mode expected {:?} but observed mode is empty",
                expected.as_str()
            )),
            Some(observed) if observed != expected => {
                if requirement.strict {
                    return Err(ImageError::ModeMismatch {
                        expected: expected.as_str().to_string(),
                        observed: observed.as_str().to_string(),
                    });
                }
                warnings.push(format!(
                    "runtime mode mismatch: expected {:?}, observed {:?}",
                    expected.as_str(),
                    observed.as_str()
                ));
            }
            Some(_) => {}
        }
    }

    if let Some(expected) = requirement.version_tag.as_deref()
        && !expected.is_empty()
        && expected != obs.version_tag
    {
        warnings.push(format!(
            "runtime version expected {:?}, observed {:?}",
            expected, obs.version_tag
        ));
    }
    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acme() -> Identity {
        Identity::from_slug("acme").unwrap()
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("My Func").unwrap(), "my-func");
        assert_eq!(sanitize("  hello__world  ").unwrap(), "hello_world");
        assert_eq!(sanitize("a..b--c").unwrap(), "a.b-c");
        assert_eq!(sanitize("-Edge.Case_").unwrap(), "edge.case");
        assert_eq!(sanitize("λ fn").unwrap(), "fn");
        assert_eq!(sanitize("").unwrap_err(), ImageError::EmptyFunctionName);
        assert!(matches!(sanitize("___"), Err(ImageError::EmptyImageName(_))));
        assert!(matches!(sanitize("!!!"), Err(ImageError::EmptyImageName(_))));
    }

    #[test]
    fn test_function_image() {
        let r = ImageResolver::new(&acme(), None, None, "v1".into());
        assert_eq!(r.function_image("Hello World").unwrap(), "acme-hello-world:v1");

        let r = ImageResolver::new(&acme(), Some("registry:5010/".into()), None, "latest".into());
        assert_eq!(
            r.function_image("echo").unwrap(),
            "registry:5010/acme-echo:latest"
        );

        let r = ImageResolver::new(&acme(), None, Some("custom".into()), "latest".into());
        assert_eq!(r.function_image("echo").unwrap(), "custom-echo:latest");
    }

    #[test]
    fn test_resolve_tag_precedence() {
        let id = acme();
        let tag = resolve_tag(&id, |name: &str| match name {
            "ACME_TAG" => Some("v2".into()),
            "ESB_TAG" => Some("v1".into()),
            _ => None,
        });
        assert_eq!(tag, "v2");
        let tag = resolve_tag(&id, |name: &str| (name == "ESB_TAG").then(|| "v1".into()));
        assert_eq!(tag, "v1");
        assert_eq!(resolve_tag(&id, |_: &str| None), "latest");
    }

    #[test]
    fn test_parse_tag() {
        assert_eq!(parse_tag("registry:5010/acme-echo:v1"), Some("v1"));
        assert_eq!(parse_tag("registry:5010/acme-echo"), None);
        assert_eq!(parse_tag("acme-echo:v1@sha256:abc"), Some("v1"));
        assert_eq!(parse_tag("acme-echo:"), None);
        assert_eq!(parse_tag(""), None);
    }

    #[test]
    fn test_infer_mode() {
        assert_eq!(
            infer_mode(["gw-docker:v1", "agent-containerd:v1"]),
            Some(RuntimeMode::Supervisor)
        );
        assert_eq!(infer_mode(["gw-docker:v1"]), Some(RuntimeMode::Daemon));
        assert_eq!(infer_mode(["gw:v1", " "]), None);
    }

    #[test]
    fn test_rewrite_base_tag() {
        assert_eq!(
            rewrite_base_tag("registry:5010/esb-lambda-base:latest", "v3").as_deref(),
            Some("registry:5010/esb-lambda-base:v3")
        );
        assert_eq!(
            rewrite_base_tag("registry:5010/esb-lambda-base", "v3").as_deref(),
            Some("registry:5010/esb-lambda-base:v3")
        );
        assert_eq!(rewrite_base_tag("esb-lambda-base:v1", "v3"), None);
        assert_eq!(rewrite_base_tag("esb-lambda-base@sha256:abc", "v3"), None);
        assert_eq!(rewrite_base_tag("other-base:latest", "v3"), None);
        assert_eq!(rewrite_base_tag("esb-lambda-base:latest", " "), None);
    }

    #[test]
    fn test_resolve_explicit_image_follows_observation() {
        let r = ImageResolver::new(&acme(), None, None, "latest".into()).with_observation(
            RuntimeObservation {
                mode: Some(RuntimeMode::Supervisor),
                version_tag: "v9".into(),
                source: "agent".into(),
            },
        );
        assert_eq!(
            r.resolve("echo", Some("esb-lambda-base:latest")).unwrap(),
            "esb-lambda-base:v9"
        );
        assert_eq!(r.resolve("echo", Some("busybox:1")).unwrap(), "busybox:1");
        assert_eq!(r.resolve("echo", None).unwrap(), "acme-echo:latest");
    }

    #[test]
    fn test_check_requirement() {
        let obs = RuntimeObservation {
            mode: Some(RuntimeMode::Daemon),
            version_tag: "v1".into(),
            source: "agent".into(),
        };
        let lenient = RuntimeRequirement {
            mode: Some(RuntimeMode::Supervisor),
            version_tag: Some("v2".into()),
            strict: false,
        };
        let warnings = check_requirement(&lenient, Some(&obs)).unwrap();
        assert_eq!(warnings.len(), 2);

        let strict = RuntimeRequirement {
            strict: true,
            ..lenient.clone()
        };
        assert!(matches!(
            check_requirement(&strict, Some(&obs)),
            Err(ImageError::ModeMismatch { .. })
        ));

        assert!(check_requirement(&RuntimeRequirement::default(), None).unwrap().is_empty());
        assert_eq!(check_requirement(&lenient, None).unwrap().len(), 1);
    }
}
