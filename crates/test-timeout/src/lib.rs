//! `#[timeout]` for synchronous unit tests.
//!
//! The test body runs on a watchdog thread; the test fails if it has not
//! finished within the limit (30 seconds unless given, e.g. `#[timeout(5)]`).

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = match parse_secs(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "#[timeout] expects a synchronous test; use #[tokio::test] for async tests",
        )
        .to_compile_error()
        .into();
    }

    let attrs: Vec<Attribute> = attrs.into_iter().filter(|a| !is_test_attr(a)).collect();
    let name = sig.ident.to_string();

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let limit = ::std::time::Duration::from_secs(#secs);
            let (tx, rx) = ::std::sync::mpsc::channel();
            ::std::thread::Builder::new()
                .name(#name.to_string())
                .spawn(move || {
                    let outcome = ::std::panic::catch_unwind(
                        ::std::panic::AssertUnwindSafe(|| #block),
                    );
                    let _ = tx.send(outcome);
                })
                .expect("spawn test thread");
            match rx.recv_timeout(limit) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => ::std::panic::resume_unwind(payload),
                Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("{} timed out after {:?}", #name, limit)
                }
                Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("{} exited without reporting a result", #name)
                }
            }
        }
    })
}

fn parse_secs(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new(Span::call_site(), "timeout must be at least one second"));
    }
    Ok(secs)
}

fn is_test_attr(attr: &Attribute) -> bool {
    attr.path().is_ident("test")
}
