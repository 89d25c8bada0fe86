//! Build-time generator registry (§4.3, §9 design note on global
//! singletons): a `strategy: generate` task names a closure registered
//! here rather than invoking reflection or an in-process `eval`.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Result;
use crate::value::Value;

use super::node::TaskNodeSpec;

/// Context passed to a registered generator at build time.
pub struct GeneratorCtx<'a> {
    pub task_name: &'a str,
    pub this_vars: &'a BTreeMap<String, Value>,
}

pub type GeneratorFn = Arc<dyn Fn(&GeneratorCtx) -> Result<Vec<TaskNodeSpec>> + Send + Sync>;

/// Threaded explicitly through the loader, builder, and runner by the
/// driver that constructs it — never a process-wide `static`/`Lazy` (the
/// one exception being the read-only string interner, which has no
/// per-run identity to preserve).
#[derive(Default, Clone)]
pub struct Registry {
    generators: BTreeMap<String, GeneratorFn>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_generator(&mut self, name: impl Into<String>, f: GeneratorFn) {
        self.generators.insert(name.into(), f);
    }

    pub fn generator(&self, name: &str) -> Option<&GeneratorFn> {
        self.generators.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_generator_is_found_by_name() {
        let mut registry = Registry::new();
        registry.register_generator("fanout", Arc::new(|_ctx: &GeneratorCtx| Ok(Vec::new())));
        assert!(registry.generator("fanout").is_some());
        assert!(registry.generator("nope").is_none());
    }
}
