//! Name to factory registry for models and losses.
//!
//! Every supported variant is registered explicitly when the registry is
//! built. Lookups that miss report the full sorted list of names.

use std::collections::BTreeMap;

use burn::tensor::backend::{AutodiffBackend, Backend};

use crate::{
    error::{RoboSatError, RoboSatResult},
    losses::{
        CrossEntropyLossConfig, FocalLossConfig, LovaszLossConfig, MixLossConfig, TrainingLoss,
    },
    models::{Net, NetConfig},
};

/// Builds a model on a device from the run's shape metadata.
pub type ModelFactory<B> = fn(&NetConfig, &<B as Backend>::Device) -> RoboSatResult<Net<B>>;

/// Builds a loss; losses take no arguments.
pub type LossFactory<B> = fn() -> Box<dyn TrainingLoss<B>>;

/// The model and loss registry.
pub struct Plugins<B: AutodiffBackend> {
    models: BTreeMap<&'static str, ModelFactory<B>>,
    losses: BTreeMap<&'static str, LossFactory<B>>,
}

impl<B: AutodiffBackend> Default for Plugins<B> {
    fn default() -> Self {
        Self::builtin()
    }
}

impl<B: AutodiffBackend> Plugins<B> {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            models: BTreeMap::new(),
            losses: BTreeMap::new(),
        }
    }

    /// Every built-in model and loss.
    pub fn builtin() -> Self {
        Self::new()
            .register_model("albunet", |config, device| config.init_albunet(device))
            .register_model("unet", |config, device| config.init_unet(device))
            .register_loss("cross_entropy", || {
                Box::new(CrossEntropyLossConfig::new().init())
            })
            .register_loss("focal", || Box::new(FocalLossConfig::new().init()))
            .register_loss("lovasz", || Box::new(LovaszLossConfig::new().init()))
            .register_loss("mix", || Box::new(MixLossConfig::new().init()))
    }

    #[must_use]
    pub fn register_model(mut self, name: &'static str, factory: ModelFactory<B>) -> Self {
        self.models.insert(name, factory);
        self
    }

    #[must_use]
    pub fn register_loss(mut self, name: &'static str, factory: LossFactory<B>) -> Self {
        self.losses.insert(name, factory);
        self
    }

    /// Registered model names, sorted.
    pub fn model_names(&self) -> Vec<String> {
        self.models.keys().map(ToString::to_string).collect()
    }

    /// Registered loss names, sorted.
    pub fn loss_names(&self) -> Vec<String> {
        self.losses.keys().map(ToString::to_string).collect()
    }

    /// # Errors
    ///
    /// Returns `UnknownPlugin` listing every registered model name.
    pub fn resolve_model(&self, name: &str) -> RoboSatResult<ModelFactory<B>> {
        self.models
            .get(name)
            .copied()
            .ok_or_else(|| RoboSatError::UnknownPlugin {
                kind: "model",
                name: name.to_string(),
                available: self.model_names(),
            })
    }

    /// # Errors
    ///
    /// Returns `UnknownPlugin` listing every registered loss name.
    pub fn resolve_loss(&self, name: &str) -> RoboSatResult<LossFactory<B>> {
        self.losses
            .get(name)
            .copied()
            .ok_or_else(|| RoboSatError::UnknownPlugin {
                kind: "loss",
                name: name.to_string(),
                available: self.loss_names(),
            })
    }

    /// Resolves and builds the configured model.
    ///
    /// # Errors
    ///
    /// Returns `UnknownPlugin` or whatever the factory reports.
    pub fn build_model(
        &self,
        name: &str,
        config: &NetConfig,
        device: &B::Device,
    ) -> RoboSatResult<Net<B>> {
        let factory = self.resolve_model(name)?;
        factory(config, device)
    }

    /// Resolves and builds the configured loss.
    ///
    /// # Errors
    ///
    /// Returns `UnknownPlugin`.
    pub fn build_loss(&self, name: &str) -> RoboSatResult<Box<dyn TrainingLoss<B>>> {
        Ok(self.resolve_loss(name)?())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestBackend = burn::backend::Autodiff<burn::backend::NdArray<f32>>;

    #[test]
    fn builtin_names_are_sorted() {
        let plugins = Plugins::<TestBackend>::builtin();
        assert_eq!(plugins.model_names(), vec!["albunet", "unet"]);
        assert_eq!(
            plugins.loss_names(),
            vec!["cross_entropy", "focal", "lovasz", "mix"]
        );
    }

    #[test]
    fn unknown_model_lists_alternatives() {
        let plugins = Plugins::<TestBackend>::builtin();
        match plugins.resolve_model("segnet") {
            Err(RoboSatError::UnknownPlugin {
                kind,
                name,
                available,
            }) => {
                assert_eq!(kind, "model");
                assert_eq!(name, "segnet");
                assert_eq!(available, vec!["albunet", "unet"]);
            }
            Err(other) => panic!("Expected UnknownPlugin, got {other:?}"),
            Ok(_) => panic!("segnet must not resolve"),
        }
    }

    #[test]
    fn unknown_loss_is_configuration_error() {
        let plugins = Plugins::<TestBackend>::builtin();
        let err = plugins.build_loss("dice").err().expect("dice is not registered");
        assert!(err.is_configuration_error());
        assert!(err.to_string().contains("lovasz"));
    }

    #[test]
    fn builds_registered_model_on_device() {
        let device = Default::default();
        let plugins = Plugins::<TestBackend>::builtin();
        let config = NetConfig::new(2, 3);

        let net = plugins.build_model("unet", &config, &device).expect("unet");
        assert!(matches!(net, Net::UNet(_)));
    }

    #[test]
    fn registration_extends_the_registry() {
        let plugins = Plugins::<TestBackend>::new()
            .register_loss("ce", || Box::new(CrossEntropyLossConfig::new().init()));
        assert_eq!(plugins.loss_names(), vec!["ce"]);
        assert!(plugins.resolve_model("albunet").is_err());
        assert!(plugins.build_loss("ce").is_ok());
    }
}
