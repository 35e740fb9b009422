// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Brand identity.
//!
//! One agent binary can serve several independent brands on the same host.
//! Everything the agent names on the host (labels, CNI network, bridge,
//! subnet, runtime namespace) is derived from a single brand slug so that two
//! agents with different slugs never collide.
//!
//! Resolution order, first non-empty wins:
//!
//! 1. `ESB_BRAND_SLUG`
//! 2. `PROJECT_NAME` without a trailing `-<ENV>` / `_<ENV>`
//! 3. `CONTAINERS_NETWORK` without `-external` and `-<ENV>` suffixes
//!    (`bridge`, `host` and `none` are not brand names)

use std::fmt;
use std::net::Ipv4Addr;

use md5::{Digest, Md5};
use thiserror::Error;

/// Explicit brand slug variable.
pub const ENV_BRAND_SLUG: &str = "ESB_BRAND_SLUG";
/// Compose project name variable.
pub const ENV_PROJECT_NAME: &str = "PROJECT_NAME";
/// Environment name variable.
pub const ENV_NAME: &str = "ENV";
/// Container network variable.
pub const ENV_CONTAINERS_NETWORK: &str = "CONTAINERS_NETWORK";

const DEFAULT_BRAND: &str = "esb";
const BRIDGE_PREFIX: &str = "esb-";
const BRIDGE_BRAND_CHARS: usize = 4;
const BRIDGE_HASH_CHARS: usize = 6;

/// Prefix length of every derived subnet.
pub const SUBNET_PREFIX_LEN: u8 = 23;
const SUBNET_THIRD_STEP: u32 = 2;
const SUBNET_THIRD_SLOTS: u32 = 128;
const SUBNET_SECOND_OCTET_EXCLUDED: u32 = 88;

/// Number of distinct `/23` subnets a slug can land on.
pub const SUBNET_POOL_SIZE: u32 = 32640;

/// Identity resolution failure.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// None of the identity sources produced a slug.
    #[error(
        "stack identity is not resolvable: set {ENV_BRAND_SLUG}, or provide {ENV_PROJECT_NAME}/{ENV_NAME}, or provide {ENV_CONTAINERS_NETWORK}"
    )]
    Unresolvable,
}

/// Where the slug came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    /// `ESB_BRAND_SLUG`.
    Explicit,
    /// `PROJECT_NAME`.
    Project,
    /// `CONTAINERS_NETWORK`.
    Network,
}

impl IdentitySource {
    /// Name of the variable the slug was read from.
    pub fn env_var(&self) -> &'static str {
        match self {
            IdentitySource::Explicit => ENV_BRAND_SLUG,
            IdentitySource::Project => ENV_PROJECT_NAME,
            IdentitySource::Network => ENV_CONTAINERS_NETWORK,
        }
    }
}

/// Process-wide brand identity. Immutable after startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    slug: String,
    source: IdentitySource,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.slug)
    }
}

impl Identity {
    /// Resolve from raw values.
    pub fn resolve_from(
        brand_slug: &str,
        project_name: &str,
        env_name: &str,
        containers_network: &str,
    ) -> Result<Self, IdentityError> {
        if let Some(slug) = normalize_slug(brand_slug) {
            return Ok(Self {
                slug,
                source: IdentitySource::Explicit,
            });
        }
        if let Some(slug) = derive_from_project(project_name, env_name) {
            return Ok(Self {
                slug,
                source: IdentitySource::Project,
            });
        }
        if let Some(slug) = derive_from_network(containers_network, env_name) {
            return Ok(Self {
                slug,
                source: IdentitySource::Network,
            });
        }
        Err(IdentityError::Unresolvable)
    }

    /// Resolve through an environment lookup function.
    pub fn resolve<F>(lookup: F) -> Result<Self, IdentityError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).unwrap_or_default();
        Self::resolve_from(
            &get(ENV_BRAND_SLUG),
            &get(ENV_PROJECT_NAME),
            &get(ENV_NAME),
            &get(ENV_CONTAINERS_NETWORK),
        )
    }

    /// Build an identity for a known slug. The slug is normalized.
    pub fn from_slug(slug: &str) -> Result<Self, IdentityError> {
        Self::resolve_from(slug, "", "", "")
    }

    /// The brand slug.
    pub fn slug(&self) -> &str {
        &self.slug
    }

    /// How the slug was resolved.
    pub fn source(&self) -> IdentitySource {
        self.source
    }

    /// `com.<slug>`
    pub fn label_prefix(&self) -> String {
        format!("com.{}", self.slug)
    }

    /// `com.<slug>.kind`
    pub fn label_kind(&self) -> String {
        format!("{}.kind", self.label_prefix())
    }

    /// `com.<slug>.owner`
    pub fn label_owner(&self) -> String {
        format!("{}.owner", self.label_prefix())
    }

    /// `<slug>_function`
    pub fn label_function(&self) -> String {
        format!("{}_function", self.slug)
    }

    /// `<slug>_env`
    pub fn label_env(&self) -> String {
        format!("{}_env", self.slug)
    }

    /// Creator label key.
    pub fn label_created_by(&self) -> &'static str {
        "created_by"
    }

    /// `<slug>-agent`
    pub fn created_by_value(&self) -> String {
        format!("{}-agent", self.slug)
    }

    /// Runtime namespace for the supervisor.
    pub fn namespace(&self) -> &str {
        &self.slug
    }

    /// Prefix for worker ids and image names.
    pub fn container_prefix(&self) -> &str {
        &self.slug
    }

    /// `<SLUG_UPPER_UNDERSCORE>`
    pub fn env_prefix(&self) -> String {
        self.slug.replace('-', "_").to_ascii_uppercase()
    }

    /// `<slug>-net`
    pub fn cni_network(&self) -> String {
        format!("{}-net", self.normalized())
    }

    /// Host bridge name, at most 14 characters.
    pub fn cni_bridge(&self) -> String {
        let brand = self.normalized();
        let mut compact: String = brand.chars().filter(|c| *c != '-').collect();
        if compact.is_empty() {
            compact = DEFAULT_BRAND.to_string();
        }
        compact.truncate(BRIDGE_BRAND_CHARS);
        let hash = hex(&md5_of(brand));
        format!("{}{}{}", BRIDGE_PREFIX, compact, &hash[..BRIDGE_HASH_CHARS])
    }

    /// The brand's preferred `/23`.
    pub fn cni_subnet(&self) -> Subnet {
        self.cni_subnet_at(0)
    }

    /// The `offset`-th subnet in the brand's probe chain. Wraps modulo the pool.
    pub fn cni_subnet_at(&self, offset: i64) -> Subnet {
        let base = i64::from(hash_mod(self.normalized(), SUBNET_POOL_SIZE));
        let slot = (base + offset).rem_euclid(i64::from(SUBNET_POOL_SIZE));
        Subnet::from_slot(slot as u32)
    }

    /// `/run/containerd/<namespace>/resolv.conf`
    pub fn resolv_conf_path(&self) -> String {
        format!("/run/containerd/{}/resolv.conf", self.namespace())
    }

    /// `/run/<slug>/cni`
    pub fn cni_runtime_dir(&self) -> String {
        format!("/run/{}/cni", self.slug)
    }

    fn normalized(&self) -> &str {
        if self.slug.is_empty() {
            DEFAULT_BRAND
        } else {
            &self.slug
        }
    }
}

/// A derived `10.x.y.0/23` block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet {
    /// Network address.
    pub network: Ipv4Addr,
    /// Prefix length.
    pub prefix: u8,
}

impl Subnet {
    fn from_slot(slot: u32) -> Self {
        let mut second = slot / SUBNET_THIRD_SLOTS;
        if second >= SUBNET_SECOND_OCTET_EXCLUDED {
            second += 1;
        }
        let third = (slot % SUBNET_THIRD_SLOTS) * SUBNET_THIRD_STEP;
        Self {
            network: Ipv4Addr::new(10, second as u8, third as u8, 0),
            prefix: SUBNET_PREFIX_LEN,
        }
    }

    /// Parse `a.b.c.d/n`. The address is masked to the network.
    pub fn parse(value: &str) -> Option<Self> {
        let (addr, prefix) = value.trim().split_once('/')?;
        let addr: Ipv4Addr = addr.parse().ok()?;
        let prefix: u8 = prefix.parse().ok()?;
        if prefix > 32 {
            return None;
        }
        let network = Ipv4Addr::from(u32::from(addr) & mask(prefix));
        Some(Self { network, prefix })
    }

    /// Last address of the block.
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !mask(self.prefix))
    }

    /// Network + 1.
    pub fn first_host(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network).wrapping_add(1))
    }

    /// Broadcast - 1.
    pub fn last_host(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.broadcast()).wrapping_sub(1))
    }

    /// Whether `ip` lies inside the block.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & mask(self.prefix) == u32::from(self.network)
    }

    /// Whether two blocks share any address.
    pub fn overlaps(&self, other: &Subnet) -> bool {
        self.contains(other.network) || other.contains(self.network)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

/// Lowercase, collapse non-alphanumeric runs to `-`, trim dashes.
pub fn normalize_slug(value: &str) -> Option<String> {
    let lowered = value.trim().to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut last_dash = false;
    for c in lowered.chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let slug = out.trim_matches('-');
    if slug.is_empty() {
        None
    } else {
        Some(slug.to_string())
    }
}

fn trim_suffix_ci<'a>(value: &'a str, suffix: &str) -> &'a str {
    let trimmed = value.trim();
    if trimmed.len() >= suffix.len()
        && trimmed.is_char_boundary(trimmed.len() - suffix.len())
        && trimmed[trimmed.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
    {
        &trimmed[..trimmed.len() - suffix.len()]
    } else {
        trimmed
    }
}

fn derive_from_project(project_name: &str, env_name: &str) -> Option<String> {
    let project = project_name.trim();
    if project.is_empty() {
        return None;
    }
    let env = env_name.trim().to_lowercase();
    let mut stripped = project;
    if !env.is_empty() {
        let hyphen = format!("-{env}");
        let underscore = format!("_{env}");
        let once = trim_suffix_ci(project, &hyphen);
        stripped = if once.len() != project.len() {
            once
        } else {
            trim_suffix_ci(project, &underscore)
        };
    }
    normalize_slug(stripped).or_else(|| normalize_slug(project_name))
}

fn derive_from_network(containers_network: &str, env_name: &str) -> Option<String> {
    let network = containers_network.trim();
    if network.is_empty() {
        return None;
    }
    if matches!(
        network.to_lowercase().as_str(),
        "bridge" | "host" | "none"
    ) {
        return None;
    }
    let mut stripped = trim_suffix_ci(network, "-external");
    stripped = trim_suffix_ci(stripped, "_external");
    let env = env_name.trim().to_lowercase();
    if !env.is_empty() {
        stripped = trim_suffix_ci(stripped, &format!("-{env}"));
        stripped = trim_suffix_ci(stripped, &format!("_{env}"));
    }
    normalize_slug(stripped).or_else(|| normalize_slug(containers_network))
}

fn md5_of(value: &str) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(value.as_bytes());
    let mut out = [0u8; 16];
    out.copy_from_slice(&hasher.finalize());
    out
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hash_mod(value: &str, modulus: u32) -> u32 {
    let sum = md5_of(value);
    u32::from_be_bytes([sum[0], sum[1], sum[2], sum[3]]) % modulus
}
