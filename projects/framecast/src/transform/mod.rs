// Frame transforms: the per-frame capabilities the worker pool applies
//
// Transforms are looked up by name in a registry filled at compile time
// (builtins) or by the embedding application (model-backed processors such
// as a face swapper).

pub mod builtin;

use crate::config::Config;
use crate::error::{FramecastError, Result};
use crate::frame::Frame;
use std::collections::BTreeMap;
use std::sync::Arc;

pub trait FrameTransform: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, frame: Frame) -> Result<Frame>;

    /// Called when the source or other configuration changes.
    fn reload(&self, _config: &Config) -> Result<()> {
        Ok(())
    }
}

pub type TransformFactory =
    Arc<dyn Fn(&Config) -> Result<Box<dyn FrameTransform>> + Send + Sync>;

#[derive(Clone)]
pub struct TransformRegistry {
    factories: BTreeMap<String, TransformFactory>,
}

impl Default for TransformRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        builtin::register_builtins(&mut registry);
        registry
    }
}

impl std::fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl TransformRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Config) -> Result<Box<dyn FrameTransform>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn create(&self, name: &str, config: &Config) -> Result<Box<dyn FrameTransform>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            FramecastError::invalid(format!(
                "unknown frame processor '{}' (available: {})",
                name,
                self.names().join(", ")
            ))
        })?;
        factory(config)
    }

    /// Builds the ordered chain for `config.frame_processors`.
    pub fn chain(&self, config: &Config) -> Result<TransformChain> {
        let transforms = config
            .frame_processors
            .iter()
            .map(|name| self.create(name, config))
            .collect::<Result<Vec<_>>>()?;
        Ok(TransformChain { transforms })
    }
}

/// Transforms applied in order to every frame.
#[derive(Default)]
pub struct TransformChain {
    transforms: Vec<Box<dyn FrameTransform>>,
}

impl TransformChain {
    pub fn new(transforms: Vec<Box<dyn FrameTransform>>) -> Self {
        Self { transforms }
    }

    pub fn apply(&self, frame: Frame) -> Result<Frame> {
        self.transforms
            .iter()
            .try_fold(frame, |frame, transform| transform.apply(frame))
    }

    pub fn reload(&self, config: &Config) -> Result<()> {
        for transform in &self.transforms {
            transform.reload(config)?;
        }
        Ok(())
    }

    pub fn names(&self) -> Vec<&str> {
        self.transforms.iter().map(|t| t.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }
}
