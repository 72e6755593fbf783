//! Component Resolver.
//!
//! Inlines `imports` into a workflow document, resolving each import's path
//! against a search order, detecting import cycles, and merging variables
//! per the shadowing rules below. Results are memoized per resolver
//! instance, keyed by canonicalized path — a document imported from two
//! different places is only parsed once.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use serde_json::Value;

use crate::document::{self, Component, ComponentType, Import, Workflow};
use crate::errors::StepwiseError;

/// Extra directories to search for an import, beyond the importing
/// document's own directory.
#[derive(Debug, Default, Clone)]
pub struct SearchPaths(pub Vec<PathBuf>);

pub struct Resolver {
    search_paths: SearchPaths,
    cache: HashMap<PathBuf, Workflow>,
    components: HashMap<String, Component>,
}

impl Resolver {
    pub fn new(search_paths: SearchPaths) -> Self {
        Self { search_paths, cache: HashMap::new(), components: HashMap::new() }
    }

    /// Loads `entry` and recursively inlines its imports, detecting cycles
    /// via an explicit loading stack. Returns the fully-resolved workflow
    /// plus the flat table of named components gathered along the way.
    pub fn resolve(&mut self, entry: &Path) -> Result<(Workflow, HashMap<String, Component>), StepwiseError> {
        let mut stack = Vec::new();
        let mut workflow = self.load_and_cache(entry, &mut stack)?;
        self.inline_imports(&mut workflow, entry, &mut stack)?;
        Ok((workflow, self.components.clone()))
    }

    fn load_and_cache(&mut self, path: &Path, stack: &mut Vec<PathBuf>) -> Result<Workflow, StepwiseError> {
        let canonical = canonicalize(path)?;
        if let Some(pos) = stack.iter().position(|p| p == &canonical) {
            let cycle: Vec<String> = stack[pos..]
                .iter()
                .chain(std::iter::once(&canonical))
                .map(|p| p.display().to_string())
                .collect();
            return Err(StepwiseError::CycleError(cycle.join(" -> ")));
        }
        if let Some(cached) = self.cache.get(&canonical) {
            return Ok(cached.clone());
        }
        let workflow = document::load(&canonical)?;
        self.cache.insert(canonical, workflow.clone());
        Ok(workflow)
    }

    fn inline_imports(
        &mut self,
        workflow: &mut Workflow,
        current_path: &Path,
        stack: &mut Vec<PathBuf>,
    ) -> Result<(), StepwiseError> {
        let canonical = canonicalize(current_path)?;
        stack.push(canonical.clone());

        let current_dir = canonical.parent().map(Path::to_path_buf).unwrap_or_default();
        let imports = std::mem::take(&mut workflow.imports);
        for import in &imports {
            let resolved_path = self.locate_import(&current_dir, import)?;
            let mut imported = self.load_and_cache(&resolved_path, stack)?;
            self.inline_imports(&mut imported, &resolved_path, stack)?;

            let mut merged_vars = imported.variables.clone();
            for (k, v) in &import.variables {
                merged_vars.insert(k.clone(), v.clone());
            }
            for (k, v) in &workflow.variables {
                merged_vars.insert(k.clone(), v.clone());
            }
            apply_overrides(&mut merged_vars, &import.overrides);

            let alias = import.alias.clone().unwrap_or_else(|| import.path.clone());

            // `type: step` components are only reachable via a step's `use` —
            // they are registered, never spliced into the importer's own step
            // list. Everything else (`group`, `workflow`, or an untyped
            // component for backward compatibility) is inlined directly,
            // since there is no `use`-style invocation for those shapes: a
            // `use` must resolve to exactly one loaded component of type
            // `step`.
            match imported.component_type {
                Some(ComponentType::Step) => {
                    let step = imported.step.clone().ok_or_else(|| {
                        StepwiseError::ImportError(format!(
                            "component '{}' declares type: step but has no 'step' field",
                            import.path
                        ))
                    })?;
                    self.components.insert(
                        alias.clone(),
                        Component { name: imported.name.clone(), variables: merged_vars.clone(), step },
                    );
                    workflow.variables.extend(merged_vars);
                }
                _ => {
                    for step in &imported.steps {
                        if let Some(name) = &step.name {
                            self.components.insert(
                                format!("{alias}.{name}"),
                                Component { name: name.clone(), variables: merged_vars.clone(), step: step.clone() },
                            );
                        }
                    }
                    workflow.variables.extend(merged_vars);
                    workflow.steps.extend(imported.steps);
                    workflow.groups.extend(imported.groups);
                }
            }
        }

        stack.pop();
        Ok(())
    }

    fn locate_import(&self, current_dir: &Path, import: &Import) -> Result<PathBuf, StepwiseError> {
        let candidate = Path::new(&import.path);
        if candidate.is_absolute() && candidate.exists() {
            return Ok(candidate.to_path_buf());
        }

        let mut search_dirs: Vec<PathBuf> = vec![current_dir.to_path_buf()];
        search_dirs.extend(self.search_paths.0.iter().cloned());
        search_dirs.push(PathBuf::from("./components"));
        search_dirs.push(PathBuf::from("./templates"));
        search_dirs.push(PathBuf::from("./examples/templates"));

        for dir in &search_dirs {
            let joined = dir.join(candidate);
            if joined.exists() {
                return Ok(joined);
            }
            for ext in ["yaml", "yml", "json"] {
                let with_ext = joined.with_extension(ext);
                if with_ext.exists() {
                    return Ok(with_ext);
                }
            }
        }

        Err(StepwiseError::ImportError(format!(
            "could not locate import '{}' from any of: {}",
            import.path,
            search_dirs.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", ")
        )))
    }

    pub fn find_component(&self, reference: &str) -> Option<&Component> {
        self.components.get(reference)
    }
}

fn apply_overrides(vars: &mut HashMap<String, Value>, overrides: &HashMap<String, Value>) {
    for (k, v) in overrides {
        vars.insert(k.clone(), v.clone());
    }
}

fn canonicalize(path: &Path) -> Result<PathBuf, StepwiseError> {
    path.canonicalize()
        .map_err(|e| StepwiseError::ImportError(format!("cannot resolve path {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn resolves_single_import() {
        let dir = tempdir();
        write_file(&dir, "child.yaml", "name: child\nsteps:\n  - name: inner\n    wait: 1ms\n");
        let entry = write_file(
            &dir,
            "main.yaml",
            "name: main\nimports:\n  - path: child.yaml\nsteps: []\n",
        );

        let mut resolver = Resolver::new(SearchPaths::default());
        let (workflow, _) = resolver.resolve(&entry).unwrap();
        assert_eq!(workflow.steps.len(), 1);
        assert_eq!(workflow.steps[0].name.as_deref(), Some("inner"));
    }

    #[test]
    fn detects_import_cycle() {
        let dir = tempdir();
        write_file(&dir, "b.yaml", "name: b\nimports:\n  - path: a.yaml\nsteps: []\n");
        let entry = write_file(&dir, "a.yaml", "name: a\nimports:\n  - path: b.yaml\nsteps: []\n");

        let mut resolver = Resolver::new(SearchPaths::default());
        let err = resolver.resolve(&entry).unwrap_err();
        assert!(matches!(err, StepwiseError::CycleError(_)));
    }

    #[test]
    fn step_component_is_registered_not_inlined() {
        let dir = tempdir();
        write_file(
            &dir,
            "login.yaml",
            "name: login\ntype: step\nvariables:\n  user: default\nstep:\n  name: do_login\n  wait: 1ms\n",
        );
        let entry = write_file(
            &dir,
            "main.yaml",
            "name: main\nimports:\n  - path: login.yaml\n    alias: login\nsteps:\n  - name: caller\n    use: login\n",
        );

        let mut resolver = Resolver::new(SearchPaths::default());
        let (workflow, components) = resolver.resolve(&entry).unwrap();
        assert_eq!(workflow.steps.len(), 1, "step components must not be spliced into the importer's steps");
        assert_eq!(workflow.steps[0].use_component.as_deref(), Some("login"));
        assert!(components.contains_key("login"));
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("stepwise-resolver-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
