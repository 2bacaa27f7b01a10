//! Procedural macros for gentest
//!
//! This crate provides the `#[gentest::test]` and `#[gentest::gen_test]`
//! attributes, which turn a function into a standard `#[test]` that runs
//! through `gentest::harness::run_test`.
//!
//! # Example
//!
//! ```rust,ignore
//! use gentest::IoLoop;
//! use std::time::Duration;
//!
//! #[gentest::test]
//! async fn my_test(io_loop: IoLoop) {
//!     io_loop.sleep(Duration::from_millis(10)).await;
//! }
//! ```

use std::time::Duration;

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{
    parse::{Nothing, Parse, ParseStream},
    parse_macro_input, Attribute, FnArg, GenericArgument, Ident, ItemFn, Lit, Meta,
    PathArguments, ReturnType, Signature, Token, Type, Visibility,
};

/// Options accepted by the `gen_test` marker.
#[derive(Debug, Default, PartialEq)]
struct MarkerArgs {
    timeout: Option<TimeoutArg>,
}

/// A parsed `timeout = ...` value.
#[derive(Debug, PartialEq)]
enum TimeoutArg {
    After(Duration),
    Never,
}

impl Parse for MarkerArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = MarkerArgs::default();

        while !input.is_empty() {
            let ident: Ident = input.parse()?;
            input.parse::<Token![=]>()?;

            match ident.to_string().as_str() {
                "timeout" => {
                    if args.timeout.is_some() {
                        return Err(syn::Error::new(ident.span(), "duplicate `timeout`"));
                    }
                    args.timeout = Some(parse_timeout(input)?);
                }
                _ => {
                    return Err(syn::Error::new(
                        ident.span(),
                        format!("unknown option: {ident}. The only option is `timeout`"),
                    ));
                }
            }

            if input.peek(Token![,]) {
                input.parse::<Token![,]>()?;
            }
        }

        Ok(args)
    }
}

/// Parses seconds (`0.5`, `10`) or `None`.
fn parse_timeout(input: ParseStream) -> syn::Result<TimeoutArg> {
    if input.peek(Token![-]) {
        let minus: Token![-] = input.parse()?;
        return Err(syn::Error::new_spanned(minus, "timeout must not be negative"));
    }
    if input.peek(Ident) {
        let ident: Ident = input.parse()?;
        if ident == "None" {
            return Ok(TimeoutArg::Never);
        }
        return Err(syn::Error::new(
            ident.span(),
            "expected seconds or `None`",
        ));
    }

    let lit: Lit = input.parse()?;
    let secs = match &lit {
        Lit::Float(f) => f.base10_parse::<f64>()?,
        Lit::Int(i) => i.base10_parse::<u32>().map(f64::from)?,
        _ => return Err(syn::Error::new_spanned(&lit, "expected seconds or `None`")),
    };
    Duration::try_from_secs_f64(secs)
        .map(TimeoutArg::After)
        .map_err(|_| syn::Error::new_spanned(&lit, "timeout out of range"))
}

/// An explicit marking found on a test function.
#[derive(Debug, PartialEq)]
enum Marker {
    Async(MarkerArgs),
    NotAsync,
}

fn marker_name(attr: &Attribute) -> Option<&'static str> {
    let last = attr.path().segments.last()?;
    if last.ident == "gen_test" {
        Some("gen_test")
    } else if last.ident == "not_gen_test" {
        Some("not_gen_test")
    } else {
        None
    }
}

/// Removes `#[gen_test(..)]` / `#[not_gen_test]` from `attrs`.
fn take_marker(attrs: &mut Vec<Attribute>) -> syn::Result<Option<Marker>> {
    let mut marker = None;
    let mut kept = Vec::with_capacity(attrs.len());

    for attr in attrs.drain(..) {
        let Some(name) = marker_name(&attr) else {
            kept.push(attr);
            continue;
        };
        if marker.is_some() {
            return Err(syn::Error::new_spanned(
                &attr,
                "a test takes at most one of `gen_test` or `not_gen_test`",
            ));
        }
        marker = Some(match (name, &attr.meta) {
            ("gen_test", Meta::Path(_)) => Marker::Async(MarkerArgs::default()),
            ("gen_test", Meta::List(_)) => Marker::Async(attr.parse_args()?),
            ("not_gen_test", Meta::Path(_)) => Marker::NotAsync,
            _ => {
                return Err(syn::Error::new_spanned(
                    &attr,
                    format!("unsupported form of `{name}`"),
                ))
            }
        });
    }

    *attrs = kept;
    Ok(marker)
}

/// What calling the function produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Routine,
    Pending,
    Plain,
}

/// Decides the shape, and the return type of the generated test.
fn detect_shape(sig: &Signature) -> (Shape, ReturnType) {
    if sig.asyncness.is_some() {
        return (Shape::Routine, sig.output.clone());
    }
    if let Some(inner) = pending_output(&sig.output) {
        let output = if is_unit(inner) {
            ReturnType::Default
        } else {
            ReturnType::Type(Default::default(), Box::new(inner.clone()))
        };
        return (Shape::Pending, output);
    }
    (Shape::Plain, sig.output.clone())
}

/// The `T` of a `-> PendingResult<T>` return type.
fn pending_output(output: &ReturnType) -> Option<&Type> {
    let ReturnType::Type(_, ty) = output else {
        return None;
    };
    let Type::Path(type_path) = &**ty else {
        return None;
    };
    let segment = type_path.path.segments.last()?;
    if segment.ident != "PendingResult" {
        return None;
    }
    let PathArguments::AngleBracketed(args) = &segment.arguments else {
        return None;
    };
    match args.args.first()? {
        GenericArgument::Type(ty) if args.args.len() == 1 => Some(ty),
        _ => None,
    }
}

fn is_unit(ty: &Type) -> bool {
    matches!(ty, Type::Tuple(tuple) if tuple.elems.is_empty())
}

/// Determines if a function parameter is requesting the loop fixture.
fn is_loop_param(arg: &FnArg) -> bool {
    if let FnArg::Typed(pat_type) = arg {
        if let Type::Path(type_path) = &*pat_type.ty {
            if let Some(segment) = type_path.path.segments.last() {
                return segment.ident == "IoLoop" && segment.arguments.is_empty();
            }
        }
    }
    false
}

fn check_signature(sig: &Signature) -> syn::Result<()> {
    if !sig.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            &sig.generics,
            "test functions cannot be generic",
        ));
    }
    if let Some(variadic) = &sig.variadic {
        return Err(syn::Error::new_spanned(variadic, "test functions cannot be variadic"));
    }
    for arg in &sig.inputs {
        if !is_loop_param(arg) {
            return Err(syn::Error::new_spanned(
                arg,
                "test parameters must be of type `IoLoop`",
            ));
        }
    }
    Ok(())
}

fn marker_tokens(marker: Option<&Marker>) -> TokenStream2 {
    match marker {
        None => quote! { ::gentest::collect::Marker::Unmarked },
        Some(Marker::NotAsync) => quote! { ::gentest::collect::Marker::NotAsync },
        Some(Marker::Async(args)) => {
            let timeout = match &args.timeout {
                None => quote! { ::core::option::Option::None },
                Some(TimeoutArg::Never) => {
                    quote! { ::core::option::Option::Some(::gentest::Deadline::Never) }
                }
                Some(TimeoutArg::After(duration)) => {
                    let secs = duration.as_secs();
                    let nanos = duration.subsec_nanos();
                    quote! {
                        ::core::option::Option::Some(::gentest::Deadline::After(
                            ::core::time::Duration::new(#secs, #nanos)
                        ))
                    }
                }
            };
            quote! {
                ::gentest::collect::Marker::Async(::gentest::config::TestConfig {
                    timeout: #timeout,
                })
            }
        }
    }
}

fn shape_tokens(shape: Shape) -> (TokenStream2, TokenStream2) {
    match shape {
        Shape::Routine => (
            quote! { ::gentest::collect::Shape::Routine },
            quote! { ::gentest::adapter::Invocation::routine },
        ),
        Shape::Pending => (
            quote! { ::gentest::collect::Shape::Pending },
            quote! { ::gentest::adapter::Invocation::pending },
        ),
        Shape::Plain => (
            quote! { ::gentest::collect::Shape::Plain },
            quote! { ::gentest::adapter::Invocation::ready },
        ),
    }
}

/// Collects a function as a gentest test.
///
/// `async fn` tests are driven on an event loop with the default deadline.
/// A plain function returning `PendingResult<T>` is driven the same way.
/// Other functions run as ordinary tests unless marked.
///
/// # Markers
///
/// - `#[gen_test]` - always drive, with the session or built-in deadline
/// - `#[gen_test(timeout = 0.5)]` - deadline in seconds, for this test only
/// - `#[gen_test(timeout = None)]` - no deadline
/// - `#[not_gen_test]` - never drive
///
/// ```rust,ignore
/// use gentest::IoLoop;
/// use std::time::Duration;
///
/// #[gentest::test]
/// #[gen_test(timeout = 0.5)]
/// async fn test_fast(io_loop: IoLoop) {
///     io_loop.sleep(Duration::from_millis(10)).await;
/// }
/// ```
///
/// # Loop Injection
///
/// Every parameter must have type `IoLoop`; each receives a handle to the
/// loop the test runs on.
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    parse_macro_input!(attr as Nothing);
    let mut input = parse_macro_input!(item as ItemFn);

    take_marker(&mut input.attrs)
        .and_then(|marker| expand_test(marker.as_ref(), input))
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

/// Collects a function as a gentest test that is always driven.
///
/// `#[gentest::gen_test(..)]` is the same as `#[gentest::test]` followed by
/// `#[gen_test(..)]`, and accepts the same `timeout` option.
///
/// ```rust,ignore
/// use gentest::IoLoop;
///
/// #[gentest::gen_test(timeout = 2)]
/// async fn test_slow(io_loop: IoLoop) {
///     io_loop.next_tick().await;
/// }
/// ```
#[proc_macro_attribute]
pub fn gen_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as MarkerArgs);
    let mut input = parse_macro_input!(item as ItemFn);

    take_marker(&mut input.attrs)
        .and_then(|inner| match inner {
            None => expand_test(Some(&Marker::Async(args)), input),
            Some(_) => Err(syn::Error::new(
                proc_macro2::Span::call_site(),
                "`gen_test` already marks this test",
            )),
        })
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

/// Rejects a second test attribute, which would register the test twice.
fn check_single_test_attr(attrs: &[Attribute]) -> syn::Result<()> {
    let duplicate = attrs.iter().find(|attr| {
        attr.path()
            .segments
            .last()
            .is_some_and(|segment| segment.ident == "test")
    });
    match duplicate {
        Some(attr) => Err(syn::Error::new_spanned(
            attr,
            "this function is already a gentest test; remove the extra test attribute",
        )),
        None => Ok(()),
    }
}

fn expand_test(marker: Option<&Marker>, input: ItemFn) -> syn::Result<TokenStream2> {
    check_single_test_attr(&input.attrs)?;
    check_signature(&input.sig)?;

    let name = &input.sig.ident;
    let attrs = &input.attrs;
    let vis = &input.vis;
    let (shape, output) = detect_shape(&input.sig);
    let (shape_tokens, invocation) = shape_tokens(shape);
    let marker = marker_tokens(marker);

    let inner_name = format_ident!("__gentest_{}", name);
    let mut inner = input.clone();
    inner.sig.ident = inner_name.clone();
    inner.attrs.clear();
    inner.vis = Visibility::Inherited;

    let args = input.sig.inputs.iter().map(|_| {
        quote! { ::core::clone::Clone::clone(&__gentest_loop) }
    });

    Ok(quote! {
        #[::core::prelude::v1::test]
        #(#attrs)*
        #vis fn #name() #output {
            #inner

            ::gentest::harness::run_test(
                ::gentest::collect::TestItem::new(
                    ::core::concat!(::core::module_path!(), "::", ::core::stringify!(#name)),
                    #shape_tokens,
                    #marker,
                ),
                |__gentest_loop: ::gentest::IoLoop| {
                    let _ = &__gentest_loop;
                    #invocation(#inner_name(#(#args),*))
                },
            )
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(src: &str) -> ItemFn {
        syn::parse_str(src).unwrap()
    }

    #[::core::prelude::v1::test]
    fn test_marker_args_parse_empty() {
        let args: MarkerArgs = syn::parse_str("").unwrap();
        assert_eq!(args, MarkerArgs::default());
    }

    #[::core::prelude::v1::test]
    fn test_marker_args_parse_timeout() {
        let args: MarkerArgs = syn::parse_str("timeout = 0.5").unwrap();
        assert_eq!(
            args.timeout,
            Some(TimeoutArg::After(Duration::from_millis(500)))
        );

        let args: MarkerArgs = syn::parse_str("timeout = 10").unwrap();
        assert_eq!(args.timeout, Some(TimeoutArg::After(Duration::from_secs(10))));

        let args: MarkerArgs = syn::parse_str("timeout = None,").unwrap();
        assert_eq!(args.timeout, Some(TimeoutArg::Never));
    }

    #[::core::prelude::v1::test]
    fn test_marker_args_reject() {
        assert!(syn::parse_str::<MarkerArgs>("timeout = -1").is_err());
        assert!(syn::parse_str::<MarkerArgs>("timeout = \"1\"").is_err());
        assert!(syn::parse_str::<MarkerArgs>("timeout = Some").is_err());
        assert!(syn::parse_str::<MarkerArgs>("deadline = 1").is_err());
        assert!(syn::parse_str::<MarkerArgs>("timeout = 1, timeout = 2").is_err());
    }

    #[::core::prelude::v1::test]
    fn test_take_marker() {
        let mut input = item("#[gen_test(timeout = 0.25)] #[ignore] fn t() {}");
        let marker = take_marker(&mut input.attrs).unwrap();
        assert_eq!(
            marker,
            Some(Marker::Async(MarkerArgs {
                timeout: Some(TimeoutArg::After(Duration::from_millis(250))),
            }))
        );
        assert_eq!(input.attrs.len(), 1);

        let mut input = item("#[not_gen_test] async fn t() {}");
        assert_eq!(take_marker(&mut input.attrs).unwrap(), Some(Marker::NotAsync));
        assert!(input.attrs.is_empty());

        let mut input = item("#[gen_test] #[not_gen_test] async fn t() {}");
        assert!(take_marker(&mut input.attrs).is_err());

        let mut input = item("#[not_gen_test(timeout = 1)] async fn t() {}");
        assert!(take_marker(&mut input.attrs).is_err());
    }

    #[::core::prelude::v1::test]
    fn test_detect_shape() {
        let (shape, _) = detect_shape(&item("async fn t() {}").sig);
        assert_eq!(shape, Shape::Routine);

        let (shape, output) = detect_shape(&item("fn t() -> PendingResult<u32> { todo!() }").sig);
        assert_eq!(shape, Shape::Pending);
        assert_eq!(quote!(#output).to_string(), quote!(-> u32).to_string());

        let (shape, output) =
            detect_shape(&item("fn t() -> gentest::PendingResult<()> { todo!() }").sig);
        assert_eq!(shape, Shape::Pending);
        assert!(matches!(output, ReturnType::Default));

        let (shape, _) = detect_shape(&item("fn t() -> bool { true }").sig);
        assert_eq!(shape, Shape::Plain);
    }

    #[::core::prelude::v1::test]
    fn test_check_signature() {
        assert!(check_signature(&item("async fn t(io_loop: IoLoop) {}").sig).is_ok());
        assert!(check_signature(&item("async fn t(a: IoLoop, b: gentest::IoLoop) {}").sig).is_ok());
        assert!(check_signature(&item("async fn t(delay: Duration) {}").sig).is_err());
        assert!(check_signature(&item("async fn t<T>() {}").sig).is_err());
        assert!(check_signature(&item("async fn t(io_loop: &IoLoop) {}").sig).is_err());
    }

    #[::core::prelude::v1::test]
    fn test_expand_wraps_in_harness() {
        let input = item("async fn fetches(io_loop: IoLoop) { io_loop.next_tick().await; }");
        let expanded = expand_test(None, input).unwrap().to_string();

        assert!(expanded.contains("fn fetches ()"));
        assert!(expanded.contains("async fn __gentest_fetches"));
        assert!(expanded.contains("Shape :: Routine"));
        assert!(expanded.contains("Marker :: Unmarked"));
        assert!(expanded.contains("Invocation :: routine"));
    }

    #[::core::prelude::v1::test]
    fn test_expand_rejects_second_test_attr() {
        let marker = Marker::Async(MarkerArgs::default());
        let input = item("#[gentest::test] async fn t() {}");
        assert!(expand_test(Some(&marker), input).is_err());

        let input = item("#[test] #[ignore] async fn t() {}");
        assert!(expand_test(None, input).is_err());

        let input = item("#[ignore] #[should_panic] async fn t() {}");
        assert!(expand_test(None, input).is_ok());
    }

    #[::core::prelude::v1::test]
    fn test_expand_explicit_timeout() {
        let marker = Marker::Async(MarkerArgs {
            timeout: Some(TimeoutArg::After(Duration::from_millis(1500))),
        });
        let expanded = expand_test(Some(&marker), item("fn t() -> bool { true }"))
            .unwrap()
            .to_string();

        assert!(expanded.contains("Duration :: new (1u64 , 500000000u32)"));
        assert!(expanded.contains("Invocation :: ready"));
    }
}
