//! `#[tokio_timeout_test]` and `#[timeout]` run a test body on a watched thread and fail it
//! once the wall-clock budget (default 60 seconds) is exhausted.
//!
//! `#[tokio_timeout_test(10, paused)]` starts the runtime with the Tokio clock paused. Paused
//! tests rely on the watchdog alone, since an in-runtime timeout would auto-advance.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::Parser;
use syn::punctuated::Punctuated;
use syn::{Attribute, Expr, ExprLit, ExprPath, ItemFn, Lit, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

struct Settings {
    secs: u64,
    paused: bool,
}

fn parse_settings(attr: TokenStream) -> syn::Result<Settings> {
    let mut settings = Settings {
        secs: DEFAULT_TIMEOUT_SECS,
        paused: false,
    };
    let args = Punctuated::<Expr, Token![,]>::parse_terminated.parse(attr)?;
    for arg in args {
        match arg {
            Expr::Lit(ExprLit {
                lit: Lit::Int(lit), ..
            }) => {
                let secs: u64 = lit.base10_parse()?;
                if secs == 0 {
                    return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
                }
                settings.secs = secs;
            }
            Expr::Path(ExprPath { ref path, .. }) if path.is_ident("paused") => {
                settings.paused = true;
            }
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "expected a timeout in seconds or `paused`",
                ))
            }
        }
    }
    Ok(settings)
}

fn last_segments_are(attr: &Attribute, expected: &[&str]) -> bool {
    let idents: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    idents == expected
}

/// Runs `body` on a fresh thread and waits at most `secs` for it to report back.
fn watchdog(secs: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        let watchdog_budget = ::std::time::Duration::from_secs(#secs);
        let (report, outcome) = ::std::sync::mpsc::channel();
        ::std::thread::spawn(move || {
            let result = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| { #body }));
            let _ = report.send(result);
        });
        match outcome.recv_timeout(watchdog_budget) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => ::std::panic::resume_unwind(payload),
            Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test exceeded {}s", #secs)
            }
            Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread exited without reporting a result")
            }
        }
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let settings = match parse_settings(attr) {
        Ok(settings) => settings,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = match syn::parse::<ItemFn>(item) {
        Ok(item) => item,
        Err(err) => return err.to_compile_error().into(),
    };

    if sig.asyncness.take().is_none() {
        return syn::Error::new_spanned(&sig.ident, "tokio_timeout_test needs an async fn")
            .to_compile_error()
            .into();
    }

    let attrs = attrs
        .into_iter()
        .filter(|attr| !last_segments_are(attr, &["tokio", "test"]));

    let secs = settings.secs;
    let (builder, driver) = if settings.paused {
        (
            quote! { .start_paused(true) },
            quote! { (async move #block).await },
        )
    } else {
        (
            quote! {},
            quote! {
                ::tokio::time::timeout(::std::time::Duration::from_secs(#secs), async move #block)
                    .await
                    .unwrap_or_else(|_| panic!("test exceeded {}s", #secs))
            },
        )
    };

    let body = watchdog(
        secs,
        quote! {
            let runtime = ::tokio::runtime::Builder::new_current_thread()
                .enable_all()
                #builder
                .build()
                .expect("tokio runtime for test");
            runtime.block_on(async { #driver });
        },
    );

    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    }
    .into()
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let settings = match parse_settings(attr) {
        Ok(settings) => settings,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = match syn::parse::<ItemFn>(item) {
        Ok(item) => item,
        Err(err) => return err.to_compile_error().into(),
    };

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(&sig.ident, "timeout expects a synchronous fn")
            .to_compile_error()
            .into();
    }
    if settings.paused {
        return syn::Error::new_spanned(&sig.ident, "`paused` only applies to tokio_timeout_test")
            .to_compile_error()
            .into();
    }

    let attrs = attrs
        .into_iter()
        .filter(|attr| !last_segments_are(attr, &["test"]));
    let body = watchdog(settings.secs, quote! { #block });

    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    }
    .into()
}
