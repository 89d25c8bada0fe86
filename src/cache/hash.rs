//! Hash providers (§4.5): turn a task's effective inputs into the digest
//! half of a cache key. Pluggable per filetype via a small registry
//! rather than a hardcoded branch, mirroring how [`crate::graph::registry`]
//! keeps build-time generators out of the core walk.

use std::collections::BTreeMap;
use std::path::Path;

use md5::{Digest, Md5};

use crate::error::{FlowError, Result};
use crate::value::Value;

/// One file (or file-like unit) contributing to a hash recipe: its path
/// relative to the rundir and its raw contents.
pub struct HashInput<'a> {
    pub path: &'a Path,
    pub contents: &'a [u8],
    pub filetype: &'a str,
}

/// A pluggable content-hash strategy. The default provider treats each
/// input opaquely; a filetype-aware provider (e.g. one that walks
/// `` `include `` graphs) can fold in transitively-reachable files the
/// default provider never sees.
pub trait HashProvider: Send + Sync {
    /// Filetypes this provider knows how to hash meaningfully. An empty
    /// slice means "any" — the fallback of last resort.
    fn supports(&self) -> &[&str];

    /// Priority among providers that both claim a filetype; higher wins.
    fn priority(&self) -> i32 {
        0
    }

    /// Fold one input's contribution into a running MD5 digest.
    fn feed(&self, hasher: &mut Md5, input: &HashInput<'_>) -> Result<()>;
}

/// Hashes sorted path + contents + filetype tag, no transitive
/// expansion. Sufficient for filetypes without a cross-file `include`
/// mechanism.
#[derive(Default)]
pub struct DefaultHashProvider;

impl HashProvider for DefaultHashProvider {
    fn supports(&self) -> &[&str] {
        &[]
    }

    fn feed(&self, hasher: &mut Md5, input: &HashInput<'_>) -> Result<()> {
        hasher.update(input.path.to_string_lossy().as_bytes());
        hasher.update(input.filetype.as_bytes());
        hasher.update(input.contents);
        Ok(())
    }
}

/// A SystemVerilog-aware provider that, in addition to the file itself,
/// walks `` `include "..." `` directives transitively so that editing a
/// header invalidates every source that pulls it in. Grounded on the
/// spec's explicit callout that per-filetype hash recipes must be able
/// to see beyond the literal file (§4.5).
pub struct IncludeGraphHashProvider {
    pub filetypes: Vec<&'static str>,
}

impl IncludeGraphHashProvider {
    pub fn verilog() -> Self {
        Self {
            filetypes: vec!["verilog", "systemverilog", "sv", "v"],
        }
    }

    fn included_paths(contents: &[u8]) -> Vec<String> {
        let text = String::from_utf8_lossy(contents);
        text.lines()
            .filter_map(|line| {
                let line = line.trim();
                let rest = line.strip_prefix("`include")?;
                let rest = rest.trim();
                let quoted = rest.strip_prefix('"')?;
                let end = quoted.find('"')?;
                Some(quoted[..end].to_string())
            })
            .collect()
    }
}

impl HashProvider for IncludeGraphHashProvider {
    fn supports(&self) -> &[&str] {
        &self.filetypes
    }

    fn priority(&self) -> i32 {
        10
    }

    fn feed(&self, hasher: &mut Md5, input: &HashInput<'_>) -> Result<()> {
        hasher.update(input.path.to_string_lossy().as_bytes());
        hasher.update(input.filetype.as_bytes());
        hasher.update(input.contents);

        let base = input.path.parent().unwrap_or_else(|| Path::new("."));
        for included in Self::included_paths(input.contents) {
            let resolved = base.join(&included);
            if let Ok(contents) = std::fs::read(&resolved) {
                hasher.update(resolved.to_string_lossy().as_bytes());
                hasher.update(&contents);
            }
        }
        Ok(())
    }
}

/// Selects the highest-priority provider supporting a given filetype,
/// falling back to any provider declaring universal support (`supports()
/// == []`).
#[derive(Default)]
pub struct HashProviderRegistry {
    providers: Vec<Box<dyn HashProvider>>,
}

impl HashProviderRegistry {
    pub fn new() -> Self {
        Self { providers: Vec::new() }
    }

    /// The default registry: the universal default plus the SV-aware
    /// include-graph walker.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(DefaultHashProvider));
        registry.register(Box::new(IncludeGraphHashProvider::verilog()));
        registry
    }

    pub fn register(&mut self, provider: Box<dyn HashProvider>) {
        self.providers.push(provider);
    }

    pub fn provider_for(&self, filetype: &str) -> Result<&dyn HashProvider> {
        self.providers
            .iter()
            .filter(|p| p.supports().is_empty() || p.supports().contains(&filetype))
            .max_by_key(|p| p.priority())
            .map(|b| b.as_ref())
            .ok_or_else(|| FlowError::NoHashProvider {
                filetype: filetype.to_string(),
            })
    }
}

/// The full hash recipe for a cache key (§4.5): task identity, effective
/// parameters, hashed input files, named environment variables, and
/// `shell(...)` tool-version stamps, folded into one MD5 digest whose
/// hex string becomes the `<hash>` half of `<task_name>:<hash>`.
pub struct HashRecipe<'a> {
    pub task_name: &'a str,
    pub params: &'a BTreeMap<String, Value>,
    pub inputs: Vec<HashInput<'a>>,
    pub env: &'a BTreeMap<String, String>,
    pub shell_stamps: &'a [String],
}

pub fn compute_cache_key(recipe: &HashRecipe<'_>, registry: &HashProviderRegistry) -> Result<String> {
    let mut hasher = Md5::new();
    hasher.update(recipe.task_name.as_bytes());

    for (k, v) in recipe.params {
        hasher.update(k.as_bytes());
        hasher.update(v.to_string().as_bytes());
    }

    let mut sorted_inputs: Vec<&HashInput<'_>> = recipe.inputs.iter().collect();
    sorted_inputs.sort_by_key(|i| i.path);
    for input in sorted_inputs {
        let provider = registry.provider_for(input.filetype)?;
        provider.feed(&mut hasher, input)?;
    }

    for (k, v) in recipe.env {
        hasher.update(k.as_bytes());
        hasher.update(v.as_bytes());
    }

    for stamp in recipe.shell_stamps {
        hasher.update(stamp.as_bytes());
    }

    let digest = hasher.finalize();
    Ok(format!("{}:{:x}", recipe.task_name, digest))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipe<'a>(
        task_name: &'a str,
        params: &'a BTreeMap<String, Value>,
        inputs: Vec<HashInput<'a>>,
        env: &'a BTreeMap<String, String>,
        shell_stamps: &'a [String],
    ) -> HashRecipe<'a> {
        HashRecipe {
            task_name,
            params,
            inputs,
            env,
            shell_stamps,
        }
    }

    #[test]
    fn cache_key_is_task_colon_hash_form() {
        let params = BTreeMap::new();
        let env = BTreeMap::new();
        let registry = HashProviderRegistry::with_defaults();
        let r = recipe("pkg.build", &params, vec![], &env, &[]);
        let key = compute_cache_key(&r, &registry).unwrap();
        let (task, hash) = key.split_once(':').unwrap();
        assert_eq!(task, "pkg.build");
        assert_eq!(hash.len(), 32);
    }

    #[test]
    fn differing_param_values_produce_differing_keys() {
        let registry = HashProviderRegistry::with_defaults();
        let env = BTreeMap::new();

        let mut params_a = BTreeMap::new();
        params_a.insert("opt".to_string(), Value::from("O2"));
        let key_a = compute_cache_key(&recipe("pkg.build", &params_a, vec![], &env, &[]), &registry).unwrap();

        let mut params_b = BTreeMap::new();
        params_b.insert("opt".to_string(), Value::from("O0"));
        let key_b = compute_cache_key(&recipe("pkg.build", &params_b, vec![], &env, &[]), &registry).unwrap();

        assert_ne!(key_a, key_b);
    }

    #[test]
    fn identical_inputs_are_deterministic() {
        let registry = HashProviderRegistry::with_defaults();
        let params = BTreeMap::new();
        let env = BTreeMap::new();
        let path = Path::new("a.v");
        let contents = b"module a; endmodule";
        let inputs = vec![HashInput {
            path,
            contents,
            filetype: "verilog",
        }];
        let r = recipe("pkg.build", &params, inputs, &env, &[]);
        let key1 = compute_cache_key(&r, &registry).unwrap();

        let inputs2 = vec![HashInput {
            path,
            contents,
            filetype: "verilog",
        }];
        let r2 = recipe("pkg.build", &params, inputs2, &env, &[]);
        let key2 = compute_cache_key(&r2, &registry).unwrap();

        assert_eq!(key1, key2);
    }

    #[test]
    fn unknown_filetype_falls_back_to_universal_default() {
        let registry = HashProviderRegistry::with_defaults();
        assert!(registry.provider_for("cpp").is_ok());
    }

    #[test]
    fn sv_provider_outranks_default_for_verilog() {
        let registry = HashProviderRegistry::with_defaults();
        let provider = registry.provider_for("verilog").unwrap();
        assert_eq!(provider.priority(), 10);
    }
}
