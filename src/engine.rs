//! The shared runtime of a server or client.
//!
//! An [`Engine`] bundles everything connections of one service share: the configuration, the
//! dispatcher, the optional timer wheel, the framer and coder, and the user's [`Handler`]. It is
//! cheap to clone.
//!
//! # Example
//!
//! ```
//! use rivet::config::EngineConfig;
//! use rivet::engine::Engine;
//! use rivet::handler::Callbacks;
//!
//! # tokio_test::block_on(async {
//! let engine = Engine::<String>::builder(EngineConfig::default())
//!     .handler(Callbacks::new().on_message(|event| async move {
//!         let _ = event.conn.send(event.msg);
//!     }))
//!     .build()?;
//! engine.start();
//! engine.shutdown().await;
//! # Ok::<(), rivet::error::ConfigError>(())
//! # }).unwrap();
//! ```

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::{
    codec::{Coder, FrameCodec, Framer},
    config::EngineConfig,
    dispatch::Dispatcher,
    error::ConfigError,
    handler::Handler,
    plugin::PluginRegistry,
    timer::TimerWheel,
};

struct EngineInner<M> {
    config: EngineConfig,
    dispatcher: Arc<dyn Dispatcher>,
    timers: Option<TimerWheel>,
    framer: Arc<dyn Framer<M>>,
    coder: Arc<dyn Coder<M>>,
    handler: Arc<dyn Handler<M>>,
    started: AtomicBool,
}

/// Shared state of every connection of a service.
pub struct Engine<M> {
    inner: Arc<EngineInner<M>>,
}

impl<M> Engine<M>
where
    M: Send + 'static,
{
    /// Starts building an engine.
    pub fn builder(config: EngineConfig) -> EngineBuilder<M> {
        EngineBuilder::new(config)
    }

    /// The configuration the engine was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The dispatcher running every callback.
    pub fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
        &self.inner.dispatcher
    }

    /// The timer wheel, unless timers were disabled in the configuration.
    pub fn timers(&self) -> Option<&TimerWheel> {
        self.inner.timers.as_ref()
    }

    /// A fresh codec for one connection.
    pub fn codec(&self) -> FrameCodec<M> {
        FrameCodec::new(self.inner.framer.clone(), self.inner.coder.clone())
    }

    pub(crate) fn handler(&self) -> &Arc<dyn Handler<M>> {
        &self.inner.handler
    }

    /// Starts the dispatcher and timer wheel. Later calls have no effect.
    ///
    /// Must be called from within a Tokio runtime. Connections start their engine automatically.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.dispatcher.start();
        if let Some(timers) = &self.inner.timers {
            timers.start();
        }
        debug!(
            dispatcher = self.inner.dispatcher.name(),
            framer = self.inner.framer.name(),
            coder = self.inner.coder.name(),
            "engine started"
        );
    }

    /// Stops the timer wheel, then drains and stops the dispatcher.
    ///
    /// Connections should be stopped first; their callbacks would otherwise run inline in whichever
    /// task submits them.
    pub async fn shutdown(&self) {
        if let Some(timers) = &self.inner.timers {
            timers.stop().await;
        }
        self.inner.dispatcher.stop().await;
        debug!("engine stopped");
    }
}

impl<M> Clone for Engine<M> {
    fn clone(&self) -> Self {
        Engine {
            inner: self.inner.clone(),
        }
    }
}

impl<M> fmt::Debug for Engine<M>
where
    M: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("dispatcher", &self.inner.dispatcher.name())
            .field("framer", &self.inner.framer.name())
            .field("coder", &self.inner.coder.name())
            .field("timers", &self.inner.timers.is_some())
            .finish()
    }
}

/// Assembles an [`Engine`] from configuration, plugins and a handler.
///
/// Plugins named in the configuration are looked up in the [`PluginRegistry`]. Explicitly supplied
/// plugins take precedence over configured names.
pub struct EngineBuilder<M> {
    config: EngineConfig,
    plugins: Option<PluginRegistry<M>>,
    handler: Option<Arc<dyn Handler<M>>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    framer: Option<Arc<dyn Framer<M>>>,
    coder: Option<Arc<dyn Coder<M>>>,
}

impl<M> EngineBuilder<M>
where
    M: Send + 'static,
{
    fn new(config: EngineConfig) -> Self {
        EngineBuilder {
            config,
            plugins: None,
            handler: None,
            dispatcher: None,
            framer: None,
            coder: None,
        }
    }

    /// Sets the registry used to resolve configured plugin names.
    ///
    /// Defaults to [`PluginRegistry::with_builtins`], or [`PluginRegistry::with_defaults`] when built
    /// through [`build`](Self::build) for a serde message type.
    pub fn plugins(mut self, plugins: PluginRegistry<M>) -> Self {
        self.plugins = Some(plugins);
        self
    }

    /// Sets the message handler. Required.
    pub fn handler(mut self, handler: impl Handler<M>) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Uses `dispatcher` instead of the configured one.
    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Uses `framer` instead of the configured one.
    pub fn framer(mut self, framer: impl Framer<M>) -> Self {
        self.framer = Some(Arc::new(framer));
        self
    }

    /// Uses `coder` instead of the configured one.
    pub fn coder(mut self, coder: impl Coder<M>) -> Self {
        self.coder = Some(Arc::new(coder));
        self
    }

    /// Builds the engine, resolving plugins through the builtin registry.
    ///
    /// For message types without serde support, either supply a coder explicitly or register one in
    /// a [`PluginRegistry`].
    pub fn build_with_builtins(self) -> Result<Engine<M>, ConfigError> {
        self.finish(PluginRegistry::with_builtins)
    }

    fn finish(
        mut self,
        fallback: impl FnOnce() -> PluginRegistry<M>,
    ) -> Result<Engine<M>, ConfigError> {
        self.config.validate()?;
        let handler = self.handler.take().ok_or(ConfigError::Invalid {
            field: "handler",
            reason: "no handler was set",
        })?;
        let plugins = self.plugins.take().unwrap_or_else(fallback);

        let dispatcher = match self.dispatcher.take() {
            Some(dispatcher) => dispatcher,
            None => plugins.dispatcher(&self.config.dispatcher, &self.config)?,
        };
        let framer = match self.framer.take() {
            Some(framer) => framer,
            None => plugins.framer(&self.config.framer)?,
        };
        let coder = match self.coder.take() {
            Some(coder) => coder,
            None => plugins.coder(&self.config.coder)?,
        };
        let timers = self
            .config
            .timers
            .then(|| TimerWheel::new(dispatcher.clone()));

        Ok(Engine {
            inner: Arc::new(EngineInner {
                config: self.config,
                dispatcher,
                timers,
                framer,
                coder,
                handler,
                started: AtomicBool::new(false),
            }),
        })
    }
}

impl<M> EngineBuilder<M>
where
    M: Serialize + DeserializeOwned + Send + 'static,
{
    /// Builds the engine, resolving plugins through [`PluginRegistry::with_defaults`] unless a
    /// registry was supplied.
    pub fn build(self) -> Result<Engine<M>, ConfigError> {
        self.finish(PluginRegistry::with_defaults)
    }
}

impl<M> fmt::Debug for EngineBuilder<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("handler", &self.handler.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::{
        codec::BytesCoder,
        connection::Connection,
        error::RegistryError,
        handler::{Callbacks, Event},
    };

    use super::*;

    #[test]
    fn unknown_dispatcher_fails_the_build() {
        let config = EngineConfig {
            dispatcher: "round_robin".to_string(),
            ..EngineConfig::default()
        };
        let err = Engine::<String>::builder(config)
            .handler(Callbacks::new())
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Registry(RegistryError::Missing {
                kind: "dispatcher",
                ..
            })
        ));
    }

    #[test]
    fn missing_handler_fails_the_build() {
        let err = Engine::<String>::builder(EngineConfig::default())
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "handler", .. }));
    }

    #[test]
    fn raw_bytes_need_an_explicit_coder() -> Result<(), Box<dyn std::error::Error>> {
        let err = Engine::<Bytes>::builder(EngineConfig::default())
            .handler(Callbacks::new())
            .build_with_builtins()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Registry(RegistryError::Missing { kind: "coder", .. })));

        let engine = Engine::<Bytes>::builder(EngineConfig::default())
            .handler(Callbacks::new())
            .coder(BytesCoder)
            .build_with_builtins()?;
        assert_eq!(engine.dispatcher().name(), "sharded");
        assert!(engine.timers().is_some());

        Ok(())
    }

    #[tokio::test]
    async fn debug_output_names_the_plugins() -> Result<(), Box<dyn std::error::Error>> {
        let engine = Engine::<Bytes>::builder(EngineConfig::default())
            .handler(Callbacks::new())
            .coder(BytesCoder)
            .build_with_builtins()?;
        let shown = format!("{engine:?}");
        assert!(shown.contains("\"sharded\"") && shown.contains("\"lv\""), "{shown}");
        assert!(format!("{:?}", engine.codec()).contains("\"bytes\""));

        let (local, _peer) = tokio::io::duplex(64);
        let event = Event {
            conn: Connection::new(&engine, local),
            msg: Bytes::from_static(b"ping"),
        };
        assert!(format!("{event:?}").contains("ping"));

        Ok(())
    }
}
