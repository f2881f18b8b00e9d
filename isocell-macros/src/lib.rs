//! isocell Macros
//!
//! Procedural macros for test registration and isolation markers.
//!
//! ## Macros
//!
//! - `#[isocell::test]` - Register a test that runs in-process
//! - `#[isocell::isolated]` - Register a test that runs in a worker process
//! - `#[isocell::suite]` - Mark every test of an inline module as isolated

use proc_macro::TokenStream;
use proc_macro2::{Span, TokenStream as TokenStream2, TokenTree};
use quote::{quote, quote_spanned};
use syn::spanned::Spanned;
use syn::{Item, ItemFn, ItemMod, parse_macro_input};

// ============================================================================
// Attribute Parsing Helpers
// ============================================================================

mod attr {
    use syn::meta::ParseNestedMeta;

    /// Get the attribute name as a string
    pub fn name(meta: &ParseNestedMeta) -> String {
        meta.path
            .get_ident()
            .map(|i| i.to_string())
            .unwrap_or_default()
    }

    /// Parse a string literal attribute: `attr = "value"`
    pub fn string(meta: &ParseNestedMeta) -> syn::Result<String> {
        let value: syn::LitStr = meta.value()?.parse()?;
        Ok(value.value())
    }

    /// Parse an integer literal attribute: `attr = 42`
    pub fn int(meta: &ParseNestedMeta) -> syn::Result<u64> {
        let value: syn::LitInt = meta.value()?.parse()?;
        value.base10_parse()
    }

    /// Parse a function path attribute: `attr = some::function`
    pub fn path(meta: &ParseNestedMeta) -> syn::Result<syn::Path> {
        meta.value()?.parse()
    }

    /// Create an unknown attribute error
    pub fn unknown(meta: &ParseNestedMeta, name: &str) -> syn::Error {
        meta.error(format!("unknown attribute: {}", name))
    }
}

/// Which attribute produced the arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Test,
    Isolated,
    Suite,
}

#[derive(Default, Clone)]
struct MarkerArgs {
    group: Option<String>,
    timeout_secs: Option<u64>,
    xfail: bool,
    setup: Option<syn::Path>,
    teardown: Option<syn::Path>,
}

impl MarkerArgs {
    /// Function-level values win over suite-level ones
    fn over(self, suite: &MarkerArgs) -> MarkerArgs {
        MarkerArgs {
            group: self.group.or_else(|| suite.group.clone()),
            timeout_secs: self.timeout_secs.or(suite.timeout_secs),
            xfail: self.xfail || suite.xfail,
            setup: self.setup.or_else(|| suite.setup.clone()),
            teardown: self.teardown.or_else(|| suite.teardown.clone()),
        }
    }
}

/// Split a leading `"group"` literal off the argument list
fn positional_group(args: TokenStream2) -> syn::Result<(Option<String>, TokenStream2)> {
    let mut tokens = args.clone().into_iter();
    let Some(TokenTree::Literal(lit)) = tokens.next() else {
        return Ok((None, args));
    };
    let group: syn::LitStr = syn::parse2(TokenTree::Literal(lit).into())?;
    match tokens.next() {
        None => Ok((Some(group.value()), TokenStream2::new())),
        Some(TokenTree::Punct(p)) if p.as_char() == ',' => {
            Ok((Some(group.value()), tokens.collect()))
        }
        Some(other) => Err(syn::Error::new(other.span(), "expected `,` after group name")),
    }
}

fn parse_marker_args(kind: Kind, args: TokenStream2) -> syn::Result<MarkerArgs> {
    let mut config = MarkerArgs::default();
    let args = if kind == Kind::Test {
        args
    } else {
        let (group, rest) = positional_group(args)?;
        config.group = group;
        rest
    };

    if args.is_empty() {
        return Ok(config);
    }

    let parser = syn::meta::parser(|meta| {
        let name = attr::name(&meta);
        match (name.as_str(), kind) {
            ("group", Kind::Isolated | Kind::Suite) => config.group = Some(attr::string(&meta)?),
            ("timeout", Kind::Isolated | Kind::Suite) => {
                config.timeout_secs = Some(attr::int(&meta)?)
            }
            ("xfail", _) => config.xfail = true,
            ("setup", _) => config.setup = Some(attr::path(&meta)?),
            ("teardown", _) => config.teardown = Some(attr::path(&meta)?),
            _ => return Err(attr::unknown(&meta, &name)),
        }
        Ok(())
    });

    syn::parse::Parser::parse2(parser, args)?;

    if config.timeout_secs == Some(0) {
        return Err(syn::Error::new(
            Span::call_site(),
            "isocell: timeout must be at least 1 second",
        ));
    }
    Ok(config)
}

fn validate_signature(func: &ItemFn) -> syn::Result<()> {
    if func.sig.asyncness.is_some() {
        return Err(syn::Error::new_spanned(
            &func.sig,
            "isocell: async test functions are not supported",
        ));
    }
    if func.sig.inputs.len() > 1 {
        return Err(syn::Error::new_spanned(
            &func.sig,
            "isocell: Function must take no arguments or exactly one: `&mut GroupContext`",
        ));
    }
    if !func.sig.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            &func.sig.generics,
            "isocell: test functions cannot be generic",
        ));
    }
    Ok(())
}

fn option_tokens<T: quote::ToTokens>(value: Option<T>) -> TokenStream2 {
    value
        .map(|v| quote! { Some(#v) })
        .unwrap_or(quote! { None })
}

/// `inventory::submit!` block registering `func`
fn registration(func: &ItemFn, args: &MarkerArgs, kind: Kind) -> syn::Result<TokenStream2> {
    validate_signature(func)?;

    let fn_name = &func.sig.ident;
    let fn_name_str = fn_name.to_string();
    let body = if func.sig.inputs.is_empty() {
        quote! { ::isocell::TestBody::Plain(#fn_name) }
    } else {
        quote! { ::isocell::TestBody::WithContext(#fn_name) }
    };

    let isolated = kind != Kind::Test;
    let scope = match kind {
        Kind::Suite => quote! { ::isocell::MarkerScope::Suite },
        _ => quote! { ::isocell::MarkerScope::Function },
    };
    let group = option_tokens(args.group.as_deref());
    let timeout_secs = option_tokens(args.timeout_secs);
    let xfail = args.xfail;
    let setup = option_tokens(args.setup.as_ref().map(|p| quote! { #p as fn() }));
    let teardown = option_tokens(args.teardown.as_ref().map(|p| quote! { #p as fn() }));

    // Source line of the function itself, so suite members keep their order
    let line = quote_spanned! { fn_name.span()=> line!() };

    Ok(quote! {
        ::isocell::internal::inventory::submit! {
            ::isocell::TestDef {
                name: #fn_name_str,
                module_path: module_path!(),
                file: file!(),
                line: #line,
                marker: ::isocell::Marker {
                    isolated: #isolated,
                    group: #group,
                    timeout_secs: #timeout_secs,
                    scope: #scope,
                },
                xfail: #xfail,
                body: #body,
                setup: #setup,
                teardown: #teardown,
            }
        }
    })
}

fn marked_fn(kind: Kind, args: TokenStream, item: TokenStream) -> TokenStream {
    let args = TokenStream2::from(args);
    let func = parse_macro_input!(item as ItemFn);

    parse_marker_args(kind, args)
        .and_then(|config| registration(&func, &config, kind))
        .map(|submit| quote! { #func #submit })
        .unwrap_or_else(|e| e.to_compile_error())
        .into()
}

/// Register a test that runs in the controlling process
///
/// # Example
///
/// ```ignore
/// #[isocell::test]
/// fn parses_header() { ... }
///
/// #[isocell::test(xfail, setup = seed_data, teardown = clear_data)]
/// fn known_bug() { ... }
/// ```
#[proc_macro_attribute]
pub fn test(args: TokenStream, item: TokenStream) -> TokenStream {
    marked_fn(Kind::Test, args, item)
}

/// Register a test that runs in a worker process
///
/// Tests naming the same group share one worker, in source order.
///
/// # Example
///
/// ```ignore
/// #[isocell::isolated]
/// fn mutates_global_state() { ... }
///
/// #[isocell::isolated("db")]
/// fn creates_table() { ... }
///
/// #[isocell::isolated(group = "db", timeout = 30, xfail)]
/// fn slow_migration(ctx: &mut GroupContext) { ... }
/// ```
#[proc_macro_attribute]
pub fn isolated(args: TokenStream, item: TokenStream) -> TokenStream {
    marked_fn(Kind::Isolated, args, item)
}

/// Mark every test function of an inline module as isolated
///
/// Functions carrying `#[test]` or `#[isolated]` inside the module are
/// registered with the suite's arguments; their own arguments win.
///
/// # Example
///
/// ```ignore
/// #[isocell::suite(group = "cache", timeout = 60)]
/// mod cache_tests {
///     #[test]
///     fn fills() { ... }
///
///     #[isolated(timeout = 120)]
///     fn evicts() { ... }
/// }
/// ```
#[proc_macro_attribute]
pub fn suite(args: TokenStream, item: TokenStream) -> TokenStream {
    let args = TokenStream2::from(args);
    let module = parse_macro_input!(item as ItemMod);

    suite_impl(args, module)
        .unwrap_or_else(|e| e.to_compile_error())
        .into()
}

fn suite_impl(args: TokenStream2, mut module: ItemMod) -> syn::Result<TokenStream2> {
    let suite = parse_marker_args(Kind::Suite, args)?;
    expand_suite(&mut module, &suite)?;
    Ok(quote! { #module })
}

fn expand_suite(module: &mut ItemMod, suite: &MarkerArgs) -> syn::Result<()> {
    let Some((_, items)) = module.content.as_mut() else {
        return Err(syn::Error::new(
            module.span(),
            "isocell: #[suite] requires an inline module (`mod name { ... }`)",
        ));
    };

    let mut registrations = Vec::new();
    for item in items.iter_mut() {
        match item {
            Item::Fn(func) => {
                if let Some((kind, args)) = take_marker(func)? {
                    let own = parse_marker_args(kind, args)?;
                    // An explicit function marker keeps its scope
                    let scope = if kind == Kind::Isolated {
                        Kind::Isolated
                    } else {
                        Kind::Suite
                    };
                    registrations.push(registration(func, &own.over(suite), scope)?);
                }
            }
            Item::Mod(inner) if inner.content.is_some() => expand_suite(inner, suite)?,
            _ => {}
        }
    }

    for tokens in registrations {
        items.push(Item::Verbatim(tokens));
    }
    Ok(())
}

/// Remove the isocell marker attribute from a suite member
fn take_marker(func: &mut ItemFn) -> syn::Result<Option<(Kind, TokenStream2)>> {
    let Some(position) = func.attrs.iter().position(|a| marker_kind(a.path()).is_some()) else {
        return Ok(None);
    };
    let attribute = func.attrs.remove(position);
    let kind = marker_kind(attribute.path()).unwrap_or(Kind::Test);
    let args = match attribute.meta {
        syn::Meta::Path(_) => TokenStream2::new(),
        syn::Meta::List(list) => list.tokens,
        syn::Meta::NameValue(nv) => {
            return Err(syn::Error::new_spanned(nv, "isocell: unexpected `=` in marker"));
        }
    };
    Ok(Some((kind, args)))
}

fn marker_kind(path: &syn::Path) -> Option<Kind> {
    let segments: Vec<String> = path.segments.iter().map(|s| s.ident.to_string()).collect();
    let last = match segments.as_slice() {
        [last] => last,
        [krate, last] if krate == "isocell" => last,
        _ => return None,
    };
    match last.as_str() {
        "test" => Some(Kind::Test),
        "isolated" => Some(Kind::Isolated),
        _ => None,
    }
}
