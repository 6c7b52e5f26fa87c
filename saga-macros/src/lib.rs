//! Proc macros for enumerated judgment label domains.
//!
//! Provides `#[derive(Label)]` for fieldless enums that represent the
//! closed answer domains of an external judgment service. The derive
//! generates the canonical wire label for each variant, the full domain
//! list, a lenient parser, the documented fail-safe default, and the JSON
//! schema fragment used when requesting a judgment.
//!
//! # Example
//!
//! ```ignore
//! /// Whether the beat plausibly admits a dialogue exchange.
//! #[derive(Label)]
//! enum Presence {
//!     Affirmed,
//!     #[label(default)]
//!     Uncertain,
//!     Denied,
//! }
//!
//! assert_eq!(Presence::variants(), &["AFFIRMED", "UNCERTAIN", "DENIED"]);
//! assert_eq!(Presence::parse_label(" denied "), Some(Presence::Denied));
//! assert_eq!(Presence::fail_safe(), Presence::Uncertain);
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, DeriveInput, Lit, Meta, Variant};

/// Derive macro for enumerated label domains.
///
/// # Attributes
///
/// - `#[label(default)]` on exactly one variant: the fail-safe default
///   substituted when the service returns a missing or out-of-domain value
/// - `#[label(rename = "...")]` on variants: override the wire label
///   (defaults to the SCREAMING_SNAKE_CASE variant name)
#[proc_macro_derive(Label, attributes(label))]
pub fn derive_label(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand_label(input)
        .unwrap_or_else(|err| err.to_compile_error())
        .into()
}

fn expand_label(input: DeriveInput) -> syn::Result<TokenStream2> {
    let enum_name = &input.ident;
    let description = get_doc_comment(&input.attrs);

    let variants = match &input.data {
        syn::Data::Enum(data) => &data.variants,
        _ => {
            return Err(syn::Error::new_spanned(
                input,
                "Label derive only supports enums",
            ))
        }
    };

    let mut labels = Vec::new();
    let mut label_arms = Vec::new();
    let mut parse_arms = Vec::new();
    let mut default_variant: Option<&Variant> = None;

    for variant in variants {
        if !matches!(variant.fields, syn::Fields::Unit) {
            return Err(syn::Error::new_spanned(
                variant,
                "Label derive only supports unit variants",
            ));
        }

        let ident = &variant.ident;
        let label = get_variant_label(variant)?;
        let label_upper = label.to_uppercase();

        labels.push(label.clone());
        label_arms.push(quote! { #enum_name::#ident => #label });
        parse_arms.push(quote! { #label_upper => Some(#enum_name::#ident) });

        if is_default_variant(variant)? {
            if default_variant.is_some() {
                return Err(syn::Error::new_spanned(
                    variant,
                    "Only one variant may carry #[label(default)]",
                ));
            }
            default_variant = Some(variant);
        }
    }

    let default_variant = default_variant.ok_or_else(|| {
        syn::Error::new_spanned(
            &input.ident,
            "Label derive requires exactly one #[label(default)] variant",
        )
    })?;
    let default_ident = &default_variant.ident;

    let label_literals: Vec<_> = labels.iter().map(|l| quote! { #l }).collect();

    Ok(quote! {
        impl #enum_name {
            /// The complete enumerated domain, in declaration order.
            pub fn variants() -> &'static [&'static str] {
                &[#(#label_literals),*]
            }

            /// The canonical wire label for this value.
            pub fn label(&self) -> &'static str {
                match self {
                    #(#label_arms),*
                }
            }

            /// Parse a wire label leniently (trimmed, case-insensitive).
            ///
            /// Returns `None` for anything outside the enumerated domain so
            /// the caller can substitute the documented fail-safe and log
            /// the substitution.
            pub fn parse_label(value: &str) -> Option<Self> {
                match value.trim().to_uppercase().as_str() {
                    #(#parse_arms,)*
                    _ => None,
                }
            }

            /// The documented fail-safe default for this domain.
            pub fn fail_safe() -> Self {
                #enum_name::#default_ident
            }

            /// JSON schema fragment for requesting this label from the
            /// judgment service.
            pub fn schema() -> serde_json::Value {
                serde_json::json!({
                    "type": "string",
                    "enum": Self::variants(),
                    "description": #description,
                })
            }
        }
    })
}

fn get_variant_label(variant: &Variant) -> syn::Result<String> {
    for attr in &variant.attrs {
        if attr.path().is_ident("label") {
            if let Ok(meta) = attr.parse_args::<Meta>() {
                if let Meta::NameValue(nv) = meta {
                    if nv.path.is_ident("rename") {
                        if let syn::Expr::Lit(expr_lit) = &nv.value {
                            if let Lit::Str(s) = &expr_lit.lit {
                                return Ok(s.value());
                            }
                        }
                    }
                }
            }
        }
    }

    Ok(to_screaming_snake_case(&variant.ident.to_string()))
}

fn is_default_variant(variant: &Variant) -> syn::Result<bool> {
    for attr in &variant.attrs {
        if attr.path().is_ident("label") {
            if let Ok(meta) = attr.parse_args::<Meta>() {
                if let Meta::Path(path) = meta {
                    if path.is_ident("default") {
                        return Ok(true);
                    }
                }
            }
        }
    }
    Ok(false)
}

fn get_doc_comment(attrs: &[syn::Attribute]) -> String {
    let mut docs = Vec::new();
    for attr in attrs {
        if attr.path().is_ident("doc") {
            if let Meta::NameValue(nv) = &attr.meta {
                if let syn::Expr::Lit(expr_lit) = &nv.value {
                    if let Lit::Str(s) = &expr_lit.lit {
                        docs.push(s.value().trim().to_string());
                    }
                }
            }
        }
    }
    docs.join(" ")
}

fn to_screaming_snake_case(s: &str) -> String {
    let mut result = String::new();
    for (i, c) in s.chars().enumerate() {
        if c.is_uppercase() && i > 0 {
            result.push('_');
        }
        result.push(c.to_ascii_uppercase());
    }
    result
}
