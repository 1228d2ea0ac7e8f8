//! Procedural macros for loopbridge
//!
//! This crate provides the `#[loopbridge::test]` attribute macro, which runs
//! an async test body on the session event loop through the full fixture
//! lifecycle.
//!
//! # Example
//!
//! ```rust,ignore
//! use loopbridge::prelude::*;
//! use std::time::Duration;
//!
//! #[loopbridge::test]
//! async fn my_test(request: Request) {
//!     let later = request.reactor().defer_later(Duration::from_millis(10), || Ok(42));
//!     assert_eq!(later.await?, 42);
//! }
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{
    parse::{Parse, ParseStream},
    parse_macro_input, FnArg, Ident, ItemFn, Lit, Pat, ReturnType, Token, Type,
};

const REACTORS: [&str; 3] = ["default", "tokio", "smol"];

/// Configuration options for the test macro.
#[derive(Default)]
struct TestConfig {
    /// Which reactor backend to install ("default", "tokio" or "smol")
    reactor: Option<String>,
    /// Module name reported for the item (default: `module_path!()`)
    module: Option<String>,
}

impl Parse for TestConfig {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut config = TestConfig::default();

        while !input.is_empty() {
            let ident: Ident = input.parse()?;
            input.parse::<Token![=]>()?;

            match ident.to_string().as_str() {
                "reactor" => {
                    let lit: Lit = input.parse()?;
                    match lit {
                        Lit::Str(s) if REACTORS.contains(&s.value().as_str()) => {
                            config.reactor = Some(s.value());
                        }
                        Lit::Str(s) => {
                            return Err(syn::Error::new(
                                s.span(),
                                format!(
                                    "unsupported reactor: {}. Use \"default\", \"tokio\" or \"smol\"",
                                    s.value()
                                ),
                            ));
                        }
                        other => return Err(syn::Error::new(other.span(), "expected a string")),
                    }
                }
                "module" => {
                    let lit: Lit = input.parse()?;
                    match lit {
                        Lit::Str(s) => config.module = Some(s.value()),
                        other => return Err(syn::Error::new(other.span(), "expected a string")),
                    }
                }
                _ => {
                    return Err(syn::Error::new(
                        ident.span(),
                        format!("unknown attribute: {ident}"),
                    ));
                }
            }

            if input.peek(Token![,]) {
                input.parse::<Token![,]>()?;
            }
        }

        Ok(config)
    }
}

/// Determines if a function parameter is requesting the item's `Request`.
fn is_request_param(arg: &FnArg) -> bool {
    if let FnArg::Typed(pat_type) = arg {
        if let Type::Path(type_path) = &*pat_type.ty {
            if let Some(segment) = type_path.path.segments.last() {
                return segment.ident == "Request";
            }
        }
    }
    false
}

/// Extracts the parameter name from a function argument.
fn get_param_name(arg: &FnArg) -> Option<&Pat> {
    if let FnArg::Typed(pat_type) = arg {
        Some(&pat_type.pat)
    } else {
        None
    }
}

/// Test attribute macro running an async body on the loopbridge event loop.
///
/// The function becomes a regular `#[test]` that starts a session, runs the
/// body as an `async` test item, tears the session down and panics with the
/// item report unless it passed.
///
/// # Basic Usage
///
/// ```rust,ignore
/// #[loopbridge::test]
/// async fn test_basic() {
///     assert_eq!(2 + 2, 4);
/// }
/// ```
///
/// A body without a return type may still use `?` with any error that
/// converts into a `loopbridge::Failure`.
///
/// # With Request Injection
///
/// Add a `request: Request` parameter to receive the item's request, which
/// carries the reactor and finalizer registration:
///
/// ```rust,ignore
/// use loopbridge::prelude::*;
///
/// #[loopbridge::test]
/// async fn test_with_request(request: Request) -> Result<(), Failure> {
///     let value = run_on_loop(request.reactor(), || Ok::<_, Failure>(7)).await?;
///     assert_eq!(value, 7);
///     Ok(())
/// }
/// ```
///
/// # Configuration Options
///
/// - `reactor = "default"`, `"tokio"` or `"smol"` - Select the backend
///   (default: read from `LOOPBRIDGE_REACTOR`)
/// - `module = "name"` - Module reported for the item
///
/// ```rust,ignore
/// #[loopbridge::test(reactor = "tokio")]
/// async fn test_on_tokio() {}
/// ```
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let config = parse_macro_input!(attr as TestConfig);
    let input = parse_macro_input!(item as ItemFn);

    expand_test(config, input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand_test(config: TestConfig, input: ItemFn) -> syn::Result<TokenStream2> {
    let name = &input.sig.ident;
    let body = &input.block;
    let attrs = &input.attrs;
    let vis = &input.vis;

    // Check if function is async
    if input.sig.asyncness.is_none() {
        return Err(syn::Error::new_spanned(
            &input.sig,
            "test function must be async",
        ));
    }

    if let Some(extra) = input.sig.inputs.iter().find(|arg| !is_request_param(arg)) {
        return Err(syn::Error::new_spanned(
            extra,
            "only a `Request` parameter is supported",
        ));
    }
    if input.sig.inputs.len() > 1 {
        return Err(syn::Error::new_spanned(
            &input.sig.inputs,
            "at most one `Request` parameter is supported",
        ));
    }

    let request_pat = match input.sig.inputs.first().and_then(get_param_name) {
        Some(pat) => quote! { #pat },
        None => quote! { _request },
    };

    let config_init = match config.reactor.as_deref() {
        None => quote! {
            ::loopbridge::config::SessionConfig::from_env()
                .unwrap_or_else(|error| panic!("invalid loopbridge configuration: {error}"))
        },
        Some(reactor) => {
            let choice = match reactor {
                "tokio" => quote! { ::loopbridge::reactor::ReactorChoice::Tokio },
                "smol" => quote! { ::loopbridge::reactor::ReactorChoice::Smol },
                _ => quote! { ::loopbridge::reactor::ReactorChoice::Default },
            };
            quote! { ::loopbridge::config::SessionConfig::new().reactor(#choice) }
        }
    };

    let module = match config.module.as_deref() {
        Some(module) => quote! { #module },
        None => quote! { ::core::module_path!() },
    };

    // A body without a return type succeeds when it finishes
    let future = match &input.sig.output {
        ReturnType::Default => quote! {
            async move {
                let () = #body;
                ::core::result::Result::Ok::<(), ::loopbridge::Failure>(())
            }
        },
        // Pin the declared type so `Ok(())` tails can infer the error type
        ReturnType::Type(_, ty) => quote! {
            async move {
                let result: #ty = #body;
                result
            }
        },
    };

    Ok(quote! {
        #[::core::prelude::v1::test]
        #(#attrs)*
        #vis fn #name() {
            let mut session = ::loopbridge::Session::start(#config_init)
                .unwrap_or_else(|error| panic!("failed to start loopbridge session: {error}"));
            let item = ::loopbridge::lifecycle::TestItem::new(
                ::core::stringify!(#name),
                ::loopbridge::lifecycle::MarkedCallable::awaitable(
                    |#request_pat: ::loopbridge::lifecycle::Request, _args| #future,
                ),
            )
            .unwrap_or_else(|error| panic!("{error}"))
            .in_module(#module);

            let report = session.run_item(&item);
            let failures = session.finish();
            report.assert_passed();
            assert!(failures.is_empty(), "session teardown failed: {failures:?}");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::{expand_test, TestConfig};

    #[::core::prelude::v1::test]
    fn test_config_parse_empty() {
        let config: TestConfig = syn::parse_str("").unwrap();
        assert!(config.reactor.is_none());
        assert!(config.module.is_none());
    }

    #[::core::prelude::v1::test]
    fn test_config_parse_reactor() {
        let config: TestConfig = syn::parse_str("reactor = \"tokio\"").unwrap();
        assert_eq!(config.reactor, Some("tokio".to_string()));
    }

    #[::core::prelude::v1::test]
    fn test_config_parse_multiple() {
        let config: TestConfig =
            syn::parse_str("reactor = \"smol\", module = \"integration\"").unwrap();
        assert_eq!(config.reactor, Some("smol".to_string()));
        assert_eq!(config.module, Some("integration".to_string()));
    }

    #[::core::prelude::v1::test]
    fn test_config_rejects_unknown() {
        assert!(syn::parse_str::<TestConfig>("reactor = \"qt5\"").is_err());
        assert!(syn::parse_str::<TestConfig>("flavor = \"multi_thread\"").is_err());
    }

    #[::core::prelude::v1::test]
    fn test_config_rejects_non_string_module() {
        let error = syn::parse_str::<TestConfig>("module = 3").err().unwrap();
        assert_eq!(error.to_string(), "expected a string");
    }

    #[::core::prelude::v1::test]
    fn test_expand_keeps_declared_return_type() {
        let input: syn::ItemFn =
            syn::parse_str("async fn typed() -> Result<(), MyFailure> { Ok(()) }").unwrap();
        let expanded = expand_test(TestConfig::default(), input).unwrap().to_string();
        assert!(expanded.contains("let result : Result < () , MyFailure > ="));
    }

    #[::core::prelude::v1::test]
    fn test_expand_rejects_sync_fn() {
        let input: syn::ItemFn = syn::parse_str("fn not_async() {}").unwrap();
        assert!(expand_test(TestConfig::default(), input).is_err());
    }

    #[::core::prelude::v1::test]
    fn test_expand_rejects_other_params() {
        let input: syn::ItemFn = syn::parse_str("async fn takes(x: u32) {}").unwrap();
        let error = expand_test(TestConfig::default(), input).unwrap_err();
        assert!(error.to_string().contains("Request"));
    }
}
