use std::{any, collections::HashMap, fmt, sync::Arc};

use bytes::Bytes;

use crate::error::{CodecError, RegistryError};

use super::Coder;

type DecodeFn<M> = Box<dyn Fn(&[u8]) -> Result<M, CodecError> + Send + Sync>;
type EncodeFn<M> = Box<dyn Fn(&M) -> Option<Result<Bytes, CodecError>> + Send + Sync>;

struct Registration<M> {
    type_name: &'static str,
    decode: DecodeFn<M>,
    encode: Option<EncodeFn<M>>,
}

/// Maps wire message ids to typed decoders.
///
/// Used by [`TypeLengthValue`](super::TypeLengthValue) framing, where each frame carries the id of
/// its payload type. Registration happens once at startup; registering an id twice is an error.
///
/// # Example
///
/// ```
/// use rivet::codec::{JsonCoder, MessageRegistry};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Ping { seq: u64 }
///
/// let mut registry = MessageRegistry::<Ping>::new();
/// registry.register::<Ping, _>(1, JsonCoder)?;
/// assert!(registry.register::<Ping, _>(1, JsonCoder).is_err());
/// # Ok::<(), rivet::error::RegistryError>(())
/// ```
pub struct MessageRegistry<M> {
    entries: HashMap<u32, Registration<M>>,
}

impl<M> MessageRegistry<M>
where
    M: 'static,
{
    /// Creates an empty registry.
    pub fn new() -> Self {
        MessageRegistry {
            entries: HashMap::new(),
        }
    }

    /// Registers a decoder that reads `T` with `coder` and converts it into `M`.
    ///
    /// Outgoing messages with this id are encoded by the connection's coder.
    pub fn register<T, C>(&mut self, id: u32, coder: C) -> Result<(), RegistryError>
    where
        T: Into<M> + 'static,
        C: Coder<T>,
    {
        self.insert(
            id,
            Registration {
                type_name: any::type_name::<T>(),
                decode: Box::new(move |bytes: &[u8]| coder.decode(bytes).map(Into::into)),
                encode: None,
            },
        )
    }

    /// Registers `T` as one variant of `M`, using `coder` in both directions.
    ///
    /// `project` borrows the `T` out of an `M` and returns `None` for other variants. This is what
    /// `#[derive(TypedMessage)]` generates for enums.
    pub fn register_variant<T, C>(
        &mut self,
        id: u32,
        coder: C,
        project: fn(&M) -> Option<&T>,
    ) -> Result<(), RegistryError>
    where
        T: Into<M> + 'static,
        C: Coder<T>,
    {
        let coder = Arc::new(coder);
        let decoder = coder.clone();
        self.insert(
            id,
            Registration {
                type_name: any::type_name::<T>(),
                decode: Box::new(move |bytes: &[u8]| decoder.decode(bytes).map(Into::into)),
                encode: Some(Box::new(move |msg: &M| {
                    project(msg).map(|inner| coder.encode(inner))
                })),
            },
        )
    }

    /// Decodes a body received with `id`.
    pub fn decode(&self, id: u32, bytes: &[u8]) -> Result<M, CodecError> {
        let entry = self
            .entries
            .get(&id)
            .ok_or(CodecError::UnknownMessage(id))?;
        (entry.decode)(bytes)
    }

    /// Encodes `msg` with the encoder registered for `id`, if there is one and it accepts `msg`.
    pub fn encode(&self, id: u32, msg: &M) -> Option<Result<Bytes, CodecError>> {
        let encode = self.entries.get(&id)?.encode.as_ref()?;
        encode(msg)
    }

    /// Returns `true` if `id` is registered.
    pub fn contains(&self, id: u32) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of registered ids.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, id: u32, registration: Registration<M>) -> Result<(), RegistryError> {
        if let Some(existing) = self.entries.get(&id) {
            return Err(RegistryError::Duplicate {
                kind: "message id",
                name: format!("{id} ({} and {})", existing.type_name, registration.type_name),
            });
        }
        self.entries.insert(id, registration);
        Ok(())
    }
}

impl<M> Default for MessageRegistry<M>
where
    M: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for MessageRegistry<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self
            .entries
            .iter()
            .map(|(id, entry)| (*id, entry.type_name))
            .collect();
        ids.sort_unstable();
        f.debug_struct("MessageRegistry")
            .field("messages", &ids)
            .finish()
    }
}
