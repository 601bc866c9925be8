//! Name-keyed construction of transformation models.

use std::collections::BTreeMap;

use super::models::{AffineModel, PolynomialModel, ProjectiveModel, RstModel};
use super::{GeometricTransformation, TransformModel};

pub type ModelConstructor = fn() -> Box<dyn TransformModel>;

/// Maps model names to constructors.
///
/// [`Default`] registers every built-in model; callers extend it with
/// [`TransformRegistry::register`].
#[derive(Debug, Clone)]
pub struct TransformRegistry {
    constructors: BTreeMap<String, ModelConstructor>,
}

impl Default for TransformRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("RST", || Box::new(RstModel));
        registry.register("Affine", || Box::new(AffineModel));
        registry.register("FirstDegreePolynomial", || Box::new(PolynomialModel::new(1)));
        registry.register("SecondDegreePolynomial", || Box::new(PolynomialModel::new(2)));
        registry.register("ThirdDegreePolynomial", || Box::new(PolynomialModel::new(3)));
        registry.register("Projective", || Box::new(ProjectiveModel));
        registry
    }
}

impl TransformRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registers `constructor` under `name`, returning the one it replaced.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        constructor: ModelConstructor,
    ) -> Option<ModelConstructor> {
        self.constructors.insert(name.into(), constructor)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Unfitted transformation for `name`, if registered.
    pub fn build(&self, name: &str) -> Option<GeometricTransformation> {
        self.constructors
            .get(name)
            .map(|constructor| GeometricTransformation::new(constructor()))
    }
}
