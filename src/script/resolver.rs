//! Module resolution for handler scripts
//!
//! Resolution order is a security decision, not a convenience: embedded
//! modules resolve FIRST so tenant code can never shadow a utility module
//! with its own file. After that, imports resolve against the app's own VFS
//! tree (no traversal above the app root), and anything else fails with
//! "module not found".

use dashmap::DashMap;
use rhai::{Engine, EvalAltResult, Module, ModuleResolver, Position, Scope, Shared};
use sha2::{Digest, Sha256};

use super::invoke;
use super::modules;
use crate::vfs::canonical_path;

/// Upper bound on cached resolved modules; the cache is cleared wholesale
/// when exceeded (entries are sha-keyed, so staleness is impossible).
const MODULE_CACHE_MAX: usize = 256;

/// Engine-level resolver consulting embedded modules then app files
pub struct FaztResolver {
    /// (app_id, path, source sha) -> compiled module
    cache: DashMap<(String, String, String), Shared<Module>>,
}

impl Default for FaztResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl FaztResolver {
    pub fn new() -> Self {
        Self {
            cache: DashMap::new(),
        }
    }
}

impl ModuleResolver for FaztResolver {
    fn resolve(
        &self,
        engine: &Engine,
        _source: Option<&str>,
        path: &str,
        pos: Position,
    ) -> Result<Shared<Module>, Box<EvalAltResult>> {
        // Embedded whitelist first; tenant files cannot shadow these.
        if let Some(module) = modules::embedded(path) {
            return Ok(module);
        }

        let Some(state) = invoke::current() else {
            return Err(not_found(path, pos));
        };

        // Relative path within the app's VFS; traversal is rejected by
        // canonicalization.
        let file_path = if path.ends_with(".rhai") {
            path.to_string()
        } else {
            format!("{path}.rhai")
        };
        let file_path = canonical_path(&file_path).map_err(|_| not_found(path, pos))?;

        let app_id = state.app.id.clone();
        let vfs = std::sync::Arc::clone(&state.vfs);
        let lookup = file_path.clone();
        let file = state
            .rt
            .block_on(async move { vfs.get(&app_id, &lookup).await })
            .map_err(|e| {
                Box::new(EvalAltResult::ErrorInModule(
                    path.to_string(),
                    Box::new(EvalAltResult::ErrorRuntime(e.to_string().into(), pos)),
                    pos,
                ))
            })?
            .ok_or_else(|| not_found(path, pos))?;

        let source = String::from_utf8(file.bytes.to_vec()).map_err(|_| not_found(path, pos))?;
        let sha = hex::encode(Sha256::digest(source.as_bytes()));
        let key = (state.app.id.clone(), file_path, sha);

        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.clone());
        }

        let ast = engine.compile(&source).map_err(|e| {
            Box::new(EvalAltResult::ErrorInModule(
                path.to_string(),
                Box::new(e.into()),
                pos,
            ))
        })?;
        let module = Module::eval_ast_as_new(Scope::new(), &ast, engine).map_err(|e| {
            Box::new(EvalAltResult::ErrorInModule(path.to_string(), e, pos))
        })?;
        let shared: Shared<Module> = Shared::new(module);

        if self.cache.len() >= MODULE_CACHE_MAX {
            self.cache.clear();
        }
        self.cache.insert(key, shared.clone());
        Ok(shared)
    }
}

fn not_found(path: &str, pos: Position) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorModuleNotFound(path.to_string(), pos))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_modules_resolve_without_an_invocation() {
        let engine = Engine::new();
        let resolver = FaztResolver::new();
        assert!(resolver
            .resolve(&engine, None, "uuid", Position::NONE)
            .is_ok());
    }

    #[test]
    fn unknown_module_is_not_found_outside_invocations() {
        let engine = Engine::new();
        let resolver = FaztResolver::new();
        let err = resolver
            .resolve(&engine, None, "nope", Position::NONE)
            .unwrap_err();
        assert!(matches!(*err, EvalAltResult::ErrorModuleNotFound(..)));
    }
}
