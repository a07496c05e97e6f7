//! Procedural macros for reactor-bridge
//!
//! This crate provides the `#[reactor_bridge::test]` attribute macro, which
//! runs an async test as a coroutine test on the process-wide bridge.
//!
//! # Example
//!
//! ```rust,ignore
//! use reactor_bridge::prelude::*;
//!
//! #[reactor_bridge::test]
//! async fn my_test(clock: MockClock) {
//!     clock.advance(Duration::from_secs(10));
//!     assert_eq!(clock.now(), Duration::from_secs(10));
//! }
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{
    parse::{Parse, ParseStream},
    parse_macro_input, FnArg, Ident, ItemFn, Lit, Pat, ReturnType, Token, Type,
};

/// Configuration options for the test macro.
#[derive(Default)]
struct TestConfig {
    /// Which reactor to install ("default", "ui" or "external")
    reactor: Option<String>,
    /// Whether the injected clock is stepped automatically (default: false)
    auto_clock: bool,
    /// Initial time for the mock clock
    start_time_secs: Option<u64>,
    /// Pump hooks attached to the installed reactor
    pumps: Vec<syn::Path>,
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
                    if let Lit::Str(s) = lit {
                        config.reactor = Some(s.value());
                    }
                }
                "auto_clock" => {
                    let lit: Lit = input.parse()?;
                    if let Lit::Bool(b) = lit {
                        config.auto_clock = b.value();
                    }
                }
                "pump" => {
                    let lit: Lit = input.parse()?;
                    if let Lit::Str(s) = lit {
                        config.pumps.push(s.parse()?);
                    }
                }
                "start_time" => {
                    let lit: Lit = input.parse()?;
                    if let Lit::Int(i) = lit {
                        config.start_time_secs = Some(i.base10_parse()?);
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

/// Determines if a function parameter is requesting a MockClock.
fn is_clock_param(arg: &FnArg) -> bool {
    if let FnArg::Typed(pat_type) = arg {
        if let Type::Path(type_path) = &*pat_type.ty {
            if let Some(segment) = type_path.path.segments.last() {
                return segment.ident == "MockClock";
            }
        }
    }
    false
}

fn get_param_name(arg: &FnArg) -> Option<&Pat> {
    if let FnArg::Typed(pat_type) = arg {
        Some(&pat_type.pat)
    } else {
        None
    }
}

/// Test attribute macro running an async test on the reactor.
///
/// The test becomes an ordinary `#[test]` function that blocks on the
/// process-wide bridge until the async body completes. A panic in the body
/// fails the test with its original message; a body returning `Err` fails
/// the test with the error.
///
/// # Basic Usage
///
/// ```rust,ignore
/// #[reactor_bridge::test]
/// async fn test_basic() {
///     let answer = async { 42 }.await;
///     assert_eq!(answer, 42);
/// }
/// ```
///
/// # With MockClock Injection
///
/// A `clock: MockClock` parameter receives a fresh mock clock. With
/// `auto_clock = true` the clock is stepped whenever the loop goes idle, so
/// sleeps on it complete without explicit advancing:
///
/// ```rust,ignore
/// #[reactor_bridge::test(auto_clock = true)]
/// async fn test_stepped(clock: MockClock) {
///     clock.sleep(Duration::from_secs(60)).await;
///     assert_eq!(clock.now(), Duration::from_secs(60));
/// }
/// ```
///
/// # Configuration Options
///
/// - `reactor = "default"`, `"ui"` or `"external"` - Install this reactor
///   kind instead of the one selected by `REACTOR_BRIDGE_REACTOR`
/// - `auto_clock = true` - Step the injected clock automatically
/// - `start_time = 100` - Start time of the injected clock in seconds
///   (default: 0)
/// - `pump = "path::to::hook"` - A `fn()` run on every loop iteration of a
///   UI reactor; may be repeated, requires `reactor`. Hooks only attach when
///   this test installs the reactor.
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

    if input.sig.asyncness.is_none() {
        return Err(syn::Error::new_spanned(
            &input.sig,
            "test function must be async",
        ));
    }

    let clock_param_name = input
        .sig
        .inputs
        .iter()
        .find(|arg| is_clock_param(arg))
        .and_then(get_param_name);
    if let Some(arg) = input.sig.inputs.iter().find(|arg| !is_clock_param(arg)) {
        return Err(syn::Error::new_spanned(
            arg,
            "only a MockClock parameter can be injected",
        ));
    }

    let pumps = &config.pumps;
    let bridge_init = match config.reactor.as_deref() {
        None if !pumps.is_empty() => {
            return Err(syn::Error::new(
                proc_macro2::Span::call_site(),
                "pump requires an explicit reactor",
            ));
        }
        None => quote! { ::reactor_bridge::bridge::Bridge::global() },
        Some(reactor) => {
            let kind = match reactor {
                "default" => quote! { Default },
                "ui" => quote! { Ui },
                "external" => quote! { External },
                _ => {
                    return Err(syn::Error::new(
                        proc_macro2::Span::call_site(),
                        format!(
                            "unsupported reactor: {reactor}. Use \"default\", \"ui\" or \"external\""
                        ),
                    ));
                }
            };
            quote! {
                ::reactor_bridge::bridge::Bridge::install(
                    &::reactor_bridge::bridge::BridgeConfig::new()
                        .reactor(::reactor_bridge::reactor::ReactorKind::#kind)
                        #(.pump_hook(#pumps))*
                )
            }
        }
    };

    let (clock_init, stepping) = match clock_param_name {
        Some(clock_name) => {
            let start_time = config.start_time_secs.unwrap_or(0);
            let init = quote! {
                let #clock_name = ::reactor_bridge::clock::MockClock::with_start_time(
                    ::std::time::Duration::from_secs(#start_time)
                );
            };
            let stepping = if config.auto_clock {
                quote! {
                    ::std::option::Option::Some(::std::sync::Arc::new(#clock_name.clone())
                        as ::std::sync::Arc<dyn ::reactor_bridge::clock::VirtualClock>)
                }
            } else {
                quote! { ::std::option::Option::None }
            };
            (init, stepping)
        }
        None if config.auto_clock => {
            return Err(syn::Error::new_spanned(
                &input.sig,
                "auto_clock requires a MockClock parameter",
            ));
        }
        None => (quote! {}, quote! { ::std::option::Option::None }),
    };

    let future = match &input.sig.output {
        ReturnType::Default => quote! {
            async move {
                #body;
                ::std::result::Result::Ok::<(), ::reactor_bridge::Error>(())
            }
        },
        ReturnType::Type(_, ty) => quote! {
            async move {
                let result: #ty = async move #body.await;
                result.map_err(::reactor_bridge::Error::body)
            }
        },
    };

    Ok(quote! {
        #[::core::prelude::v1::test]
        #(#attrs)*
        #vis fn #name() {
            let bridge = match #bridge_init {
                ::std::result::Result::Ok(bridge) => bridge,
                ::std::result::Result::Err(error) => {
                    ::std::panic!("reactor-bridge setup failed: {}", error)
                }
            };
            #clock_init
            let stepping = #stepping;
            if let ::std::result::Result::Err(error) =
                ::reactor_bridge::invoke::run_coroutine(&bridge, stepping, #future)
            {
                ::std::panic!("{}", error);
            }
        }
    })
}
