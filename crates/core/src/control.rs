//! The control-function contract and the ordered registry that runs it.

use crate::context::Context;
use crate::error::EngineError;

/// One pluggable decision unit.
///
/// Every cycle the orchestrator calls `sense`, then `compare`, then `respond` only
/// if `compare` returned true. Working state set in `sense` must be fully
/// re-derived each time; nothing carries over from a previous cycle.
pub trait ControlFunction: Send + Sync {
    fn describe(&self) -> &'static str;

    /// Observe the context and compute working fields. No cache writes, except
    /// configuration-store publication for downstream units.
    fn sense(&mut self, ctx: &mut Context) -> Result<(), EngineError>;

    /// Whether live state drifted from desired state for this unit's concern.
    fn compare(&self) -> bool;

    /// Encode the correction as cache-entry patches.
    fn respond(&mut self, ctx: &mut Context) -> Result<(), EngineError>;
}

/// Control functions in execution order. Later units may read what earlier ones published.
#[derive(Default)]
pub struct ControlRegistry {
    units: Vec<Box<dyn ControlFunction>>,
}

impl ControlRegistry {
    pub fn new() -> Self { Self::default() }

    /// Append a unit. Names must be unique.
    pub fn register(&mut self, unit: Box<dyn ControlFunction>) -> Result<(), EngineError> {
        let name = unit.describe();
        if self.units.iter().any(|u| u.describe() == name) {
            return Err(EngineError::DuplicateUnit(name));
        }
        self.units.push(unit);
        Ok(())
    }

    pub fn with(mut self, unit: impl ControlFunction + 'static) -> Result<Self, EngineError> {
        self.register(Box::new(unit))?;
        Ok(self)
    }

    pub fn names(&self) -> Vec<&'static str> { self.units.iter().map(|u| u.describe()).collect() }
    pub fn len(&self) -> usize { self.units.len() }
    pub fn is_empty(&self) -> bool { self.units.is_empty() }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn ControlFunction>> { self.units.iter_mut() }
}

impl std::fmt::Debug for ControlRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlRegistry").field("units", &self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl ControlFunction for Named {
        fn describe(&self) -> &'static str { self.0 }
        fn sense(&mut self, _ctx: &mut Context) -> Result<(), EngineError> { Ok(()) }
        fn compare(&self) -> bool { false }
        fn respond(&mut self, _ctx: &mut Context) -> Result<(), EngineError> { Ok(()) }
    }

    #[test]
    fn registry_keeps_registration_order() {
        let reg = ControlRegistry::new().with(Named("b")).unwrap().with(Named("a")).unwrap();
        assert_eq!(reg.names(), vec!["b", "a"]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = ControlRegistry::new().with(Named("a")).unwrap().with(Named("a")).unwrap_err();
        assert_eq!(err, EngineError::DuplicateUnit("a"));
    }
}
