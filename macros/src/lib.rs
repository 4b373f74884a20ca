mod derive_typed_message;

use derive_typed_message::DeriveTypedMessage;
use proc_macro::TokenStream;
use quote::ToTokens;
use syn::parse_macro_input;

/// Derive macro implementing the `TypedMessage` trait, used by type-length-value framing.
///
/// On a struct, the id comes from a `#[message(id = N)]` attribute on the type. On an enum, every
/// variant holds exactly one message type and carries its own `#[message(id = N)]`; the macro then
/// also implements `From<Variant>` for the enum.
///
/// In both cases a `register_messages(registry, coder)` function is generated that registers every
/// id in a `MessageRegistry`. Duplicate ids within one enum are rejected at compile time.
///
/// # Example
///
/// ```ignore
/// use rivet::TypedMessage;
///
/// #[derive(Serialize, Deserialize)]
/// struct Join { room: String }
///
/// #[derive(Serialize, Deserialize)]
/// struct Leave { room: String }
///
/// #[derive(TypedMessage)]
/// enum Command {
///     #[message(id = 10)]
///     Join(Join),
///     #[message(id = 11)]
///     Leave(Leave),
/// }
///
/// let mut registry = MessageRegistry::new();
/// Command::register_messages(&mut registry, JsonCoder)?;
/// let framer = TypeLengthValue::new(Arc::new(registry));
/// ```
///
/// <details>
/// <summary>See expanded code</summary>
///
/// ```ignore
/// impl rivet::codec::TypedMessage for Command {
///     fn message_id(&self) -> u32 {
///         match self {
///             Self::Join(_) => 10,
///             Self::Leave(_) => 11,
///         }
///     }
/// }
///
/// impl From<Join> for Command {
///     fn from(msg: Join) -> Self {
///         Self::Join(msg)
///     }
/// }
///
/// // ...
///
/// impl Command {
///     pub fn register_messages<C>(
///         registry: &mut rivet::codec::MessageRegistry<Self>,
///         coder: C,
///     ) -> Result<(), rivet::error::RegistryError>
///     where
///         C: Clone + rivet::codec::Coder<Join> + rivet::codec::Coder<Leave>,
///     {
///         registry.register_variant::<Join, C>(10, coder.clone(), |msg| match msg {
///             Self::Join(inner) => Some(inner),
///             _ => None,
///         })?;
///         // ...
///         Ok(())
///     }
/// }
/// ```
/// </details>
#[proc_macro_derive(TypedMessage, attributes(message))]
pub fn derive_typed_message(input: TokenStream) -> TokenStream {
    let derive_typed_message = parse_macro_input!(input as DeriveTypedMessage);
    TokenStream::from(derive_typed_message.into_token_stream())
}
