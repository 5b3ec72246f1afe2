use crate::backends;
use crate::config::Config;
use crate::engine::{Materializer, ResourceExhausted};

/// Materializes the jobs of one backend, returning the number of jobs created.
pub type Constructor = fn(&Config, &mut Materializer<'_>) -> Result<usize, ResourceExhausted>;

/// Ordered list of the backends a run materializes jobs for.
///
/// Names are unique. Only used before the scheduler starts.
#[derive(Default)]
pub struct DriverRegistry {
    constructors: Vec<(&'static str, Constructor)>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry of every backend built into `cnc`.
    pub fn with_builtin_backends() -> Self {
        let mut registry = Self::new();
        backends::register_builtin(&mut registry);
        registry
    }

    /// Registers a backend. Returns `false` and keeps the existing entry if
    /// `name` is registered already.
    pub fn register(&mut self, name: &'static str, constructor: Constructor) -> bool {
        if self.constructors.iter().any(|(known, _)| *known == name) {
            log::warn!(target: "engine::registry", "Backend {name} is registered already, ignoring");
            return false;
        }
        self.constructors.push((name, constructor));
        true
    }

    /// Backends in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, Constructor)> + '_ {
        self.constructors.iter().copied()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.constructors.iter().map(|(name, _)| *name).collect()
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn none(_: &Config, _: &mut Materializer<'_>) -> Result<usize, ResourceExhausted> {
        Ok(0)
    }

    fn one(_: &Config, _: &mut Materializer<'_>) -> Result<usize, ResourceExhausted> {
        Ok(1)
    }

    #[test]
    fn builtin_backends_in_order() {
        let registry = DriverRegistry::with_builtin_backends();
        assert_eq!(registry.names(), ["postgres", "mongodb"]);
    }

    #[test]
    fn duplicate_names_are_ignored() {
        let mut registry = DriverRegistry::new();
        assert!(registry.register("postgres", none));
        assert!(!registry.register("postgres", one));
        assert!(registry.register("mongodb", one));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), ["postgres", "mongodb"]);
    }
}
