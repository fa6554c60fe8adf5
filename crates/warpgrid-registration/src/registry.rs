//! Explicit solver registry.
//!
//! Solvers are looked up by name from a registry the application populates
//! once at startup; nothing registers itself implicitly.

use std::collections::BTreeMap;

use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};

use crate::error::{RegistrationError, Result};
use crate::metric::MetricKind;
use crate::solver::{MeshLoadSolver, MeshSolverConfig, PdeSolverConfig, PdeUpdateRule, SolverStrategy, VoxelPdeSolver};
use crate::validation::radius_array;

/// Everything a factory needs to build a solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverSettings {
    pub metric: MetricKind,
    /// Neighbourhood radius in voxels: one value for every axis or one per axis.
    pub radius: Vec<usize>,
    /// Overrides the metric's maximize convention.
    pub maximize: Option<bool>,
    pub pde: PdeSolverConfig,
    pub mesh: MeshSolverConfig,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            metric: MetricKind::default(),
            radius: vec![1],
            maximize: None,
            pde: PdeSolverConfig::new(),
            mesh: MeshSolverConfig::new(),
        }
    }
}

impl SolverSettings {
    pub fn with_metric(mut self, metric: MetricKind) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_radius(mut self, radius: Vec<usize>) -> Self {
        self.radius = radius;
        self
    }

    pub fn with_maximize(mut self, maximize: Option<bool>) -> Self {
        self.maximize = maximize;
        self
    }

    pub fn with_pde(mut self, pde: PdeSolverConfig) -> Self {
        self.pde = pde;
        self
    }

    pub fn with_mesh(mut self, mesh: MeshSolverConfig) -> Self {
        self.mesh = mesh;
        self
    }
}

/// Builds a solver from settings.
pub type SolverFactory<B, const D: usize> =
    Box<dyn Fn(&SolverSettings) -> Result<Box<dyn SolverStrategy<B, D>>> + Send + Sync>;

/// Name-indexed solver factories.
pub struct SolverRegistry<B: Backend, const D: usize> {
    factories: BTreeMap<String, SolverFactory<B, D>>,
}

impl<B: Backend, const D: usize> Default for SolverRegistry<B, D> {
    fn default() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }
}

impl<B: Backend, const D: usize> SolverRegistry<B, D> {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in solvers: `demons`, `symmetric-forces`,
    /// `gradient-step` and `fem`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for rule in [PdeUpdateRule::Demons, PdeUpdateRule::SymmetricForces, PdeUpdateRule::GradientStep] {
            registry.register(rule.name(), move |settings: &SolverSettings| {
                let config = settings.pde.clone().with_update_rule(rule);
                let radius = radius_array::<D>(&settings.radius)?;
                let mut solver = VoxelPdeSolver::<B, D>::new(config, settings.metric.build(), radius)?;
                if let Some(maximize) = settings.maximize {
                    solver = solver.with_maximize(maximize);
                }
                Ok(Box::new(solver) as Box<dyn SolverStrategy<B, D>>)
            });
        }
        registry.register("fem", |settings: &SolverSettings| {
            let mut solver = MeshLoadSolver::<B, D>::new(
                settings.mesh.clone(),
                settings.metric.build(),
                radius_array::<D>(&settings.radius)?,
            )?;
            if let Some(maximize) = settings.maximize {
                solver = solver.with_maximize(maximize);
            }
            Ok(Box::new(solver) as Box<dyn SolverStrategy<B, D>>)
        });
        registry
    }

    /// Register a factory, replacing any previous one with the same name.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&SolverSettings) -> Result<Box<dyn SolverStrategy<B, D>>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Build the solver registered under `name`.
    ///
    /// # Errors
    /// [`RegistrationError::Configuration`] for an unknown name or invalid
    /// settings.
    pub fn create(&self, name: &str, settings: &SolverSettings) -> Result<Box<dyn SolverStrategy<B, D>>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            RegistrationError::configuration(format!(
                "unknown solver '{}', expected one of {:?}",
                name,
                self.names()
            ))
        })?;
        factory(settings)
    }
}
