use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{
    parse::Parser, punctuated::Punctuated, spanned::Spanned, visit::Visit, Expr, FnArg,
    GenericParam, ImplItem, ImplItemFn, ItemImpl, ReturnType, Token, Type, TypeImplTrait,
};

const LISTEN_ATTR: &str = "listen";

const BOXED_FUTURE_HINT: &str =
    "return Pin<Box<dyn Future<Output = _> + Send>> from a plain fn instead";

struct ListenerMethod {
    name: syn::Ident,
    args: Vec<Expr>,
    handler_ty: TokenStream2,
}

pub fn expand_listeners(attr: TokenStream, item: TokenStream) -> TokenStream {
    if !attr.is_empty() {
        let attr = TokenStream2::from(attr);
        return syn::Error::new(attr.span(), "#[listeners] takes no arguments")
            .to_compile_error()
            .into();
    }

    let mut item_impl = syn::parse_macro_input!(item as ItemImpl);

    match collect_listeners(&mut item_impl) {
        Ok(methods) => {
            let registration = registration_impl(&item_impl, &methods);
            TokenStream::from(quote! {
                #item_impl
                #registration
            })
        }
        Err(err) => {
            let err = err.to_compile_error();
            TokenStream::from(quote! {
                #item_impl
                #err
            })
        }
    }
}

/// Strip `#[listen]` from every method and collect what it declared.
fn collect_listeners(item_impl: &mut ItemImpl) -> syn::Result<Vec<ListenerMethod>> {
    if let Some((_, path, _)) = &item_impl.trait_ {
        return Err(syn::Error::new(
            path.span(),
            "#[listeners] must be placed on an inherent impl block",
        ));
    }
    check_impl_generics(item_impl)?;

    let mut methods = Vec::new();
    let mut errors: Option<syn::Error> = None;

    for impl_item in item_impl.items.iter_mut() {
        let ImplItem::Fn(method) = impl_item else {
            continue;
        };

        let result = take_listen_attr(method).and_then(|args| match args {
            Some(args) => {
                let handler_ty = handler_type(method)?;
                Ok(Some(ListenerMethod {
                    name: method.sig.ident.clone(),
                    args,
                    handler_ty,
                }))
            }
            None => Ok(None),
        });

        match result {
            Ok(Some(listener)) => methods.push(listener),
            Ok(None) => {}
            Err(err) => match &mut errors {
                Some(existing) => existing.combine(err),
                None => errors = Some(err),
            },
        }
    }

    match errors {
        Some(err) => Err(err),
        None => Ok(methods),
    }
}

/// Remove the `#[listen(...)]` attribute and parse its arguments.
fn take_listen_attr(method: &mut ImplItemFn) -> syn::Result<Option<Vec<Expr>>> {
    let (listen, rest): (Vec<_>, Vec<_>) = method
        .attrs
        .drain(..)
        .partition(|attr| attr.path().is_ident(LISTEN_ATTR));
    method.attrs = rest;

    let mut listen = listen.into_iter();
    let Some(attr) = listen.next() else {
        return Ok(None);
    };
    if let Some(extra) = listen.next() {
        return Err(syn::Error::new(
            extra.span(),
            "a method can be bound to only one queue; remove the extra #[listen]",
        ));
    }

    let list = attr.meta.require_list()?;
    let args = Punctuated::<Expr, Token![,]>::parse_terminated.parse2(list.tokens.clone())?;
    let args: Vec<Expr> = args.into_iter().collect();

    match args.len() {
        1..=3 => {}
        0 => {
            return Err(syn::Error::new(
                attr.span(),
                "#[listen] needs a source queue, e.g. #[listen(\"orders\")]",
            ))
        }
        _ => {
            return Err(syn::Error::new(
                attr.span(),
                "#[listen] takes (source), (source, connection), (source, options) or (source, options, connection)",
            ))
        }
    }

    Ok(Some(args))
}

/// Function pointer type matching the method signature.
fn handler_type(method: &ImplItemFn) -> syn::Result<TokenStream2> {
    let sig = &method.sig;

    if let Some(asyncness) = &sig.asyncness {
        return Err(syn::Error::new(
            asyncness.span(),
            format!("async listener methods are not supported; {}", BOXED_FUTURE_HINT),
        ));
    }
    if !sig.generics.params.is_empty() || sig.generics.where_clause.is_some() {
        return Err(syn::Error::new(
            sig.generics.span(),
            "generic listener methods are not supported",
        ));
    }
    if let Some(variadic) = &sig.variadic {
        return Err(syn::Error::new(
            variadic.span(),
            "variadic listener methods are not supported",
        ));
    }

    let mut inputs = Vec::with_capacity(sig.inputs.len());
    for input in &sig.inputs {
        let ty: &Type = match input {
            FnArg::Receiver(receiver) => &*receiver.ty,
            FnArg::Typed(pat_type) => &*pat_type.ty,
        };
        if let Some(impl_trait) = find_impl_trait(ty) {
            return Err(syn::Error::new(
                impl_trait.span(),
                "`impl Trait` arguments are not supported in listener methods",
            ));
        }
        inputs.push(ty);
    }

    if let ReturnType::Type(_, ty) = &sig.output {
        if let Some(impl_trait) = find_impl_trait(ty) {
            return Err(syn::Error::new(
                impl_trait.span(),
                format!(
                    "`impl Trait` return types are not supported in listener methods; {}",
                    BOXED_FUTURE_HINT
                ),
            ));
        }
    }

    let unsafety = &sig.unsafety;
    let abi = &sig.abi;
    let output = &sig.output;

    Ok(quote! { #unsafety #abi fn(#(#inputs),*) #output })
}

/// First `impl Trait` anywhere inside `ty`, including generic arguments.
fn find_impl_trait(ty: &Type) -> Option<&TypeImplTrait> {
    struct Finder<'ast> {
        found: Option<&'ast TypeImplTrait>,
    }

    impl<'ast> Visit<'ast> for Finder<'ast> {
        fn visit_type_impl_trait(&mut self, node: &'ast TypeImplTrait) {
            if self.found.is_none() {
                self.found = Some(node);
            }
        }
    }

    let mut finder = Finder { found: None };
    finder.visit_type(ty);
    finder.found
}

/// Listener owners are identified by `TypeId`, so every type parameter must be `'static`.
fn check_impl_generics(item_impl: &ItemImpl) -> syn::Result<()> {
    for param in &item_impl.generics.params {
        if let GenericParam::Lifetime(lifetime) = param {
            return Err(syn::Error::new(
                lifetime.span(),
                "#[listeners] types must be 'static; remove the lifetime parameter",
            ));
        }
    }
    Ok(())
}

fn registration_impl(item_impl: &ItemImpl, methods: &[ListenerMethod]) -> TokenStream2 {
    let self_ty = &item_impl.self_ty;

    let mut generics = item_impl.generics.clone();
    let static_bounds: Vec<syn::WherePredicate> = generics
        .type_params()
        .map(|param| {
            let ident = &param.ident;
            syn::parse_quote! { #ident: 'static }
        })
        .collect();
    generics.make_where_clause().predicates.extend(static_bounds);
    let (impl_generics, _, where_clause) = generics.split_for_impl();
    let count = methods.len();

    let registrations = methods.iter().map(|method| {
        let name = &method.name;
        let handler_name = name.to_string();
        let handler_ty = &method.handler_ty;

        let declaration = match method.args.as_slice() {
            [source] => quote! { ::amqp_listen::Listen::new(#source) },
            [source, second] => quote! { ::amqp_listen::Listen::on(#source, #second) },
            [source, options, connection] => quote! {
                ::amqp_listen::Listen::on_connection(#source, #options, #connection)
            },
            _ => unreachable!("listen arguments are checked while parsing"),
        };

        quote! {
            registrations.push(
                #declaration.apply::<Self, __S, #handler_ty>(
                    store,
                    #handler_name,
                    Self::#name as #handler_ty,
                )?
            );
        }
    });

    quote! {
        impl #impl_generics ::amqp_listen::Listeners for #self_ty #where_clause {
            fn register_listeners<__S: ::amqp_listen::MetadataStore + ?Sized>(
                store: &__S,
            ) -> ::std::result::Result<
                ::std::vec::Vec<::std::sync::Arc<::amqp_listen::ListenerRegistration>>,
                ::amqp_listen::ListenError,
            > {
                let mut registrations = ::std::vec::Vec::with_capacity(#count);
                #(#registrations)*
                Ok(registrations)
            }
        }
    }
}
