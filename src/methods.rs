//! # Method Registry
//!
//! Named factories for the per-stream reconciliation method and the
//! per-source probability method. Streams and sources refer to methods by
//! name; the registry builds them from plain context structs.

use crate::config::ReconciliationConfig;
use crate::error::{Result, SmartfireError};
use crate::layers::LayerReader;
use crate::model::{Fire, ReconciliationStream, Source, DEFAULT_METHOD};
use crate::reconcile::{DefaultReconciliation, ReconciliationMethod};
use hashbrown::HashMap;
use std::sync::Arc;

/// Assigns a detection probability to fires of one source
pub trait ProbabilityMethod: Send + Sync {
    fn fire_probability(&self, fire: &Fire) -> f64;
}

/// Every fire of the source is real unless it is a false alarm
#[derive(Debug, Clone, Copy)]
pub struct DefaultProbability {
    false_alarm_rate: f64,
}

impl DefaultProbability {
    pub fn new(source: &Source) -> Self {
        Self {
            false_alarm_rate: source.false_alarm_rate,
        }
    }
}

impl ProbabilityMethod for DefaultProbability {
    fn fire_probability(&self, _fire: &Fire) -> f64 {
        1.0 - self.false_alarm_rate
    }
}

/// Everything a reconciliation method factory may draw on
#[derive(Clone)]
pub struct MethodContext {
    pub stream: Arc<ReconciliationStream>,
    pub layers: Arc<dyn LayerReader>,
    pub settings: ReconciliationConfig,
}

pub type ReconciliationFactory =
    Box<dyn Fn(&MethodContext) -> Box<dyn ReconciliationMethod> + Send + Sync>;
pub type ProbabilityFactory = Box<dyn Fn(&Source) -> Box<dyn ProbabilityMethod> + Send + Sync>;

/// Name to factory lookup for pluggable methods
pub struct MethodRegistry {
    reconciliation: HashMap<String, ReconciliationFactory>,
    probability: HashMap<String, ProbabilityFactory>,
}

impl MethodRegistry {
    /// Registry with nothing registered
    pub fn empty() -> Self {
        Self {
            reconciliation: HashMap::new(),
            probability: HashMap::new(),
        }
    }

    /// Registry with the built-in `default` methods
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register_reconciliation(DEFAULT_METHOD, |context| {
            Box::new(DefaultReconciliation::new(context))
        });
        registry.register_probability(DEFAULT_METHOD, |source| {
            Box::new(DefaultProbability::new(source))
        });
        registry
    }

    pub fn register_reconciliation<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&MethodContext) -> Box<dyn ReconciliationMethod> + Send + Sync + 'static,
    {
        self.reconciliation.insert(name.into(), Box::new(factory));
    }

    pub fn register_probability<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Source) -> Box<dyn ProbabilityMethod> + Send + Sync + 'static,
    {
        self.probability.insert(name.into(), Box::new(factory));
    }

    pub fn new_reconciliation_method(
        &self,
        name: &str,
        context: &MethodContext,
    ) -> Result<Box<dyn ReconciliationMethod>> {
        let factory = self.reconciliation.get(name).ok_or_else(|| {
            SmartfireError::invalid(format!("No such reconciliation method \"{}\"", name))
        })?;
        Ok(factory(context))
    }

    pub fn new_probability_method(
        &self,
        name: &str,
        source: &Source,
    ) -> Result<Box<dyn ProbabilityMethod>> {
        let factory = self.probability.get(name).ok_or_else(|| {
            SmartfireError::invalid(format!("No such probability method \"{}\"", name))
        })?;
        Ok(factory(source))
    }

    /// Registered reconciliation method names, sorted
    pub fn reconciliation_methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.reconciliation.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Registered probability method names, sorted
    pub fn probability_methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.probability.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
