//! Named plugins selectable from configuration.
//!
//! A [`PluginRegistry`] maps the names used in [`EngineConfig`] to dispatcher factories, coders and
//! framers. It is an ordinary value populated at startup and handed to the
//! [`EngineBuilder`](crate::engine::EngineBuilder); there is no global registry. Registering a name
//! twice fails, and so does looking up a name that was never registered.

use std::{collections::HashMap, fmt, sync::Arc};

use serde::{de::DeserializeOwned, Serialize};

use crate::{
    codec::{Coder, Framer, JsonCoder, LengthValue, Line},
    config::EngineConfig,
    dispatch::{Dispatcher, Elastic, Sharded, SingleLoop},
    error::RegistryError,
};

/// Builds a dispatcher from the engine configuration.
pub type DispatcherFactory = Box<dyn Fn(&EngineConfig) -> Arc<dyn Dispatcher> + Send + Sync>;

/// Dispatcher, coder and framer plugins by name.
pub struct PluginRegistry<M> {
    dispatchers: HashMap<String, DispatcherFactory>,
    coders: HashMap<String, Arc<dyn Coder<M>>>,
    framers: HashMap<String, Arc<dyn Framer<M>>>,
}

impl<M> PluginRegistry<M>
where
    M: Send + 'static,
{
    /// Creates an empty registry.
    pub fn new() -> Self {
        PluginRegistry {
            dispatchers: HashMap::new(),
            coders: HashMap::new(),
            framers: HashMap::new(),
        }
    }

    /// Creates a registry holding the plugins that work for any message type: the `single_loop`,
    /// `sharded` and `elastic` dispatchers and the `lv` and `line` framers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.insert_builtins();
        registry
    }

    fn insert_builtins(&mut self) {
        self.dispatchers.insert(
            "single_loop".to_string(),
            Box::new(|config: &EngineConfig| {
                Arc::new(SingleLoop::new(config.single_loop.queue_size)) as Arc<dyn Dispatcher>
            }),
        );
        self.dispatchers.insert(
            "sharded".to_string(),
            Box::new(|config: &EngineConfig| {
                Arc::new(Sharded::new(
                    config.sharded.workers,
                    config.sharded.queue_size,
                )) as Arc<dyn Dispatcher>
            }),
        );
        self.dispatchers.insert(
            "elastic".to_string(),
            Box::new(|config: &EngineConfig| {
                Arc::new(Elastic::new(
                    config.elastic.max_workers,
                    config.elastic.idle_timeout(),
                )) as Arc<dyn Dispatcher>
            }),
        );
        self.framers
            .insert("lv".to_string(), Arc::new(LengthValue::default()));
        self.framers.insert("line".to_string(), Arc::new(Line::default()));
    }

    /// Registers a dispatcher factory.
    pub fn register_dispatcher<F>(
        &mut self,
        name: impl Into<String>,
        factory: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(&EngineConfig) -> Arc<dyn Dispatcher> + Send + Sync + 'static,
    {
        insert_unique(&mut self.dispatchers, "dispatcher", name.into(), Box::new(factory))
    }

    /// Registers a coder.
    pub fn register_coder(
        &mut self,
        name: impl Into<String>,
        coder: impl Coder<M>,
    ) -> Result<(), RegistryError> {
        insert_unique(&mut self.coders, "coder", name.into(), Arc::new(coder))
    }

    /// Registers a framer.
    pub fn register_framer(
        &mut self,
        name: impl Into<String>,
        framer: impl Framer<M>,
    ) -> Result<(), RegistryError> {
        insert_unique(&mut self.framers, "framer", name.into(), Arc::new(framer))
    }

    /// Builds the dispatcher registered under `name`.
    pub fn dispatcher(
        &self,
        name: &str,
        config: &EngineConfig,
    ) -> Result<Arc<dyn Dispatcher>, RegistryError> {
        let factory = lookup(&self.dispatchers, "dispatcher", name)?;
        Ok(factory(config))
    }

    /// Returns the coder registered under `name`.
    pub fn coder(&self, name: &str) -> Result<Arc<dyn Coder<M>>, RegistryError> {
        lookup(&self.coders, "coder", name).cloned()
    }

    /// Returns the framer registered under `name`.
    pub fn framer(&self, name: &str) -> Result<Arc<dyn Framer<M>>, RegistryError> {
        lookup(&self.framers, "framer", name).cloned()
    }
}

impl<M> PluginRegistry<M>
where
    M: Serialize + DeserializeOwned + Send + 'static,
{
    /// Creates a registry with the builtins plus the `json` coder, and `msgpack` when that feature
    /// is enabled.
    pub fn with_defaults() -> Self {
        let mut registry = Self::with_builtins();
        registry
            .coders
            .insert("json".to_string(), Arc::new(JsonCoder));
        #[cfg(feature = "msgpack")]
        registry
            .coders
            .insert("msgpack".to_string(), Arc::new(crate::codec::MsgPackCoder));
        registry
    }
}

impl<M> Default for PluginRegistry<M>
where
    M: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for PluginRegistry<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn names<V>(map: &HashMap<String, V>) -> Vec<&str> {
            let mut names: Vec<_> = map.keys().map(String::as_str).collect();
            names.sort_unstable();
            names
        }

        f.debug_struct("PluginRegistry")
            .field("dispatchers", &names(&self.dispatchers))
            .field("coders", &names(&self.coders))
            .field("framers", &names(&self.framers))
            .finish()
    }
}

fn insert_unique<V>(
    map: &mut HashMap<String, V>,
    kind: &'static str,
    name: String,
    value: V,
) -> Result<(), RegistryError> {
    if map.contains_key(&name) {
        return Err(RegistryError::Duplicate { kind, name });
    }
    map.insert(name, value);
    Ok(())
}

fn lookup<'a, V>(
    map: &'a HashMap<String, V>,
    kind: &'static str,
    name: &str,
) -> Result<&'a V, RegistryError> {
    map.get(name).ok_or_else(|| RegistryError::Missing {
        kind,
        name: name.to_string(),
    })
}
