use std::collections::HashMap;

use quote::{quote, ToTokens};
use syn::{
    custom_keyword,
    parse::{Parse, ParseStream},
    spanned::Spanned,
    Attribute, Data, DeriveInput, Fields, Generics, Ident, LitInt, Token, Type,
};

custom_keyword!(id);

pub struct DeriveTypedMessage {
    ident: Ident,
    generics: Generics,
    kind: MessageKind,
}

enum MessageKind {
    Struct { id: u32 },
    Enum { variants: Vec<MessageVariant> },
}

struct MessageVariant {
    ident: Ident,
    ty: Type,
    id: u32,
}

impl ToTokens for DeriveTypedMessage {
    fn to_tokens(&self, tokens: &mut proc_macro2::TokenStream) {
        let Self {
            ident,
            generics,
            kind,
        } = self;
        let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

        match kind {
            MessageKind::Struct { id } => {
                tokens.extend(quote! {
                    #[automatically_derived]
                    impl #impl_generics ::rivet::codec::TypedMessage for #ident #ty_generics #where_clause {
                        #[inline]
                        fn message_id(&self) -> u32 {
                            #id
                        }
                    }

                    #[automatically_derived]
                    impl #impl_generics #ident #ty_generics #where_clause {
                        /// Registers this message under its id, encoded and decoded with `coder`.
                        pub fn register_messages<__C>(
                            registry: &mut ::rivet::codec::MessageRegistry<Self>,
                            coder: __C,
                        ) -> ::std::result::Result<(), ::rivet::error::RegistryError>
                        where
                            __C: ::rivet::codec::Coder<Self>,
                        {
                            registry.register_variant::<Self, __C>(#id, coder, |msg| {
                                ::std::option::Option::Some(msg)
                            })
                        }
                    }
                });
            }
            MessageKind::Enum { variants } => {
                let id_arms = variants.iter().map(|MessageVariant { ident, id, .. }| {
                    quote! { Self::#ident(_) => #id, }
                });
                let from_impls = variants.iter().map(|MessageVariant { ident: variant, ty, .. }| {
                    quote! {
                        #[automatically_derived]
                        impl #impl_generics ::std::convert::From<#ty> for #ident #ty_generics #where_clause {
                            #[inline]
                            fn from(msg: #ty) -> Self {
                                Self::#variant(msg)
                            }
                        }
                    }
                });
                let coder_bounds = variants.iter().map(|MessageVariant { ty, .. }| {
                    quote! { ::rivet::codec::Coder<#ty> }
                });
                let registrations = variants.iter().map(|MessageVariant { ident, ty, id }| {
                    quote! {
                        registry.register_variant::<#ty, __C>(
                            #id,
                            ::std::clone::Clone::clone(&coder),
                            |msg| match msg {
                                Self::#ident(inner) => ::std::option::Option::Some(inner),
                                #[allow(unreachable_patterns)]
                                _ => ::std::option::Option::None,
                            },
                        )?;
                    }
                });

                tokens.extend(quote! {
                    #[automatically_derived]
                    impl #impl_generics ::rivet::codec::TypedMessage for #ident #ty_generics #where_clause {
                        fn message_id(&self) -> u32 {
                            match self {
                                #( #id_arms )*
                            }
                        }
                    }

                    #( #from_impls )*

                    #[automatically_derived]
                    impl #impl_generics #ident #ty_generics #where_clause {
                        /// Registers every variant under its id, encoded and decoded with `coder`.
                        pub fn register_messages<__C>(
                            registry: &mut ::rivet::codec::MessageRegistry<Self>,
                            coder: __C,
                        ) -> ::std::result::Result<(), ::rivet::error::RegistryError>
                        where
                            __C: ::std::clone::Clone #( + #coder_bounds )*,
                        {
                            #( #registrations )*
                            ::std::result::Result::Ok(())
                        }
                    }
                });
            }
        }
    }
}

impl Parse for DeriveTypedMessage {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let input: DeriveInput = input.parse()?;
        let ident = input.ident;
        let generics = input.generics;

        let kind = match input.data {
            Data::Struct(_) => {
                let id = parse_message_id(&input.attrs)?.ok_or_else(|| {
                    syn::Error::new(ident.span(), "missing #[message(id = ...)] attribute")
                })?;
                MessageKind::Struct { id }
            }
            Data::Enum(data) => {
                if data.variants.is_empty() {
                    return Err(syn::Error::new(
                        ident.span(),
                        "TypedMessage cannot be derived for an empty enum",
                    ));
                }

                let mut seen: HashMap<u32, Ident> = HashMap::new();
                let mut variants = Vec::with_capacity(data.variants.len());
                for variant in data.variants {
                    let span = variant.span();
                    let id = parse_message_id(&variant.attrs)?.ok_or_else(|| {
                        syn::Error::new(span, "missing #[message(id = ...)] attribute on variant")
                    })?;
                    let ty = match variant.fields {
                        Fields::Unnamed(fields) if fields.unnamed.len() == 1 => {
                            fields.unnamed.into_iter().next().map(|field| field.ty)
                        }
                        _ => None,
                    }
                    .ok_or_else(|| {
                        syn::Error::new(span, "variants must hold exactly one unnamed field")
                    })?;
                    if let Some(other) = seen.insert(id, variant.ident.clone()) {
                        return Err(syn::Error::new(
                            span,
                            format!("message id {id} is already used by variant `{other}`"),
                        ));
                    }

                    variants.push(MessageVariant {
                        ident: variant.ident,
                        ty,
                        id,
                    });
                }

                MessageKind::Enum { variants }
            }
            Data::Union(_) => {
                return Err(syn::Error::new(
                    ident.span(),
                    "TypedMessage cannot be derived for unions",
                ));
            }
        };

        Ok(DeriveTypedMessage {
            ident,
            generics,
            kind,
        })
    }
}

fn parse_message_id(attrs: &[Attribute]) -> syn::Result<Option<u32>> {
    let mut found = None;
    for attr in attrs {
        if !attr.path().is_ident("message") {
            continue;
        }
        if found.is_some() {
            return Err(syn::Error::new(
                attr.span(),
                "message attribute already specified",
            ));
        }
        let MessageAttr { id } = attr.parse_args()?;
        found = Some(id);
    }

    Ok(found)
}

struct MessageAttr {
    id: u32,
}

impl Parse for MessageAttr {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let _: id = input.parse()?;
        let _: Token![=] = input.parse()?;
        let lit: LitInt = input.parse()?;
        let id = lit.base10_parse()?;
        let _: Option<Token![,]> = input.parse()?;

        Ok(MessageAttr { id })
    }
}
