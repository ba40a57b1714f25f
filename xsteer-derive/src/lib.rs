use proc_macro::TokenStream;
use proc_macro_crate::{FoundCrate, crate_name};
use quote::quote;
use syn::{
    Attribute, Data, DeriveInput, Error, Fields, GenericArgument, Ident, PathArguments, ReturnType,
    Type, TypePath, parse_macro_input, spanned::Spanned,
};

/// Derive macro for the `ShmSafe` trait.
///
/// Generates an implementation of `ShmSafe` after verifying at compile time
/// that the type can live in memory shared between processes.
///
/// # Compile-Time Checks
///
/// 1. **Stable layout**: the type must carry `#[repr(C)]`,
///    `#[repr(transparent)]`, or an integer repr for enums. The map and ring
///    state are mapped by separately compiled processes; the default Rust
///    layout gives no cross-build guarantee.
///
/// 2. **No pointer types**: fields must not contain types that hold virtual
///    addresses, which are meaningless in another process. Rejected:
///    `Vec`, `Box`, `String`, `PathBuf`, `OsString`, `CString`, `Rc`, `Arc`,
///    references, raw pointers, and process-local sync primitives
///    (`Mutex`, `RwLock`, `Condvar`, `Barrier`).
///
/// 3. **Recursive safety**: every field type must itself implement `ShmSafe`,
///    enforced through generated where-clauses.
///
/// # Safety
///
/// The generated impl is `unsafe impl ShmSafe` because part of the contract
/// cannot be checked syntactically: concurrent access from several processes
/// must be mediated by atomics, and the type must remain sound if `Drop`
/// never runs (a crashed process skips destructors). The macro validates
/// layout and pointer-freedom; the author answers for the rest.
///
/// # Example
///
/// ```
/// # use xsteer::ShmSafe;
/// use std::sync::atomic::AtomicU64;
///
/// #[derive(ShmSafe)]
/// #[repr(C)]
/// struct SlotWord {
///     sock: AtomicU64,
/// }
/// ```
///
/// ```compile_fail
/// # use xsteer::ShmSafe;
/// #[derive(ShmSafe)]
/// #[repr(C)]
/// struct Bad {
///     frames: Vec<u8>,  // heap pointer, rejected
/// }
/// ```
#[proc_macro_derive(ShmSafe)]
pub fn derive_shm_safe(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match derive_shm_safe_impl(input) {
        Ok(tokens) => tokens,
        Err(err) => err.to_compile_error().into(),
    }
}

fn get_crate_path() -> proc_macro2::TokenStream {
    match crate_name("xsteer") {
        Ok(FoundCrate::Itself) => {
            quote!(::xsteer)
        }
        Ok(FoundCrate::Name(name)) => {
            let ident = syn::Ident::new(&name, proc_macro2::Span::call_site());
            quote!(::#ident)
        }
        Err(_) => {
            quote!(::xsteer)
        }
    }
}

fn derive_shm_safe_impl(input: DeriveInput) -> syn::Result<TokenStream> {
    check_repr(&input)?;

    let field_types = get_field_types(&input.data)?;
    field_types.iter().try_for_each(check_types)?;

    let name = &input.ident;
    let generics = &input.generics;
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let crate_path = get_crate_path();

    let mut where_predicates = where_clause
        .map(|w| w.predicates.iter().cloned().collect::<Vec<_>>())
        .unwrap_or_default();

    for ty in &field_types {
        where_predicates.push(syn::parse_quote! {
            #ty: #crate_path::__ShmSafePrivate
        });
    }

    let expanded = if where_predicates.is_empty() {
        quote! {
            unsafe impl #impl_generics #crate_path::__ShmSafePrivate for #name #ty_generics #where_clause {}
        }
    } else {
        quote! {
            unsafe impl #impl_generics #crate_path::__ShmSafePrivate for #name #ty_generics
            where
                #(#where_predicates),*
            {}
        }
    };

    Ok(expanded.into())
}

fn is_valid_repr_ident(ident: &syn::Ident) -> bool {
    ident == "C"
        || ident == "transparent"
        || ident == "u8"
        || ident == "u16"
        || ident == "u32"
        || ident == "u64"
        || ident == "u128"
        || ident == "usize"
        || ident == "i8"
        || ident == "i16"
        || ident == "i32"
        || ident == "i64"
        || ident == "i128"
        || ident == "isize"
}

fn has_valid_repr(attr: &Attribute) -> syn::Result<bool> {
    if !attr.path().is_ident("repr") {
        return Ok(false);
    }

    let mut valid = false;

    attr.parse_nested_meta(|meta| {
        if let Some(ident) = meta.path.get_ident() {
            if is_valid_repr_ident(ident) {
                valid = true;
            }
        }
        Ok(())
    })?;

    Ok(valid)
}

fn check_repr(input: &DeriveInput) -> syn::Result<()> {
    let has_valid =
        input.attrs.iter().try_fold(
            false,
            |acc, attr| {
                if acc { Ok(true) } else { has_valid_repr(attr) }
            },
        )?;

    if !has_valid {
        let help_msg = if matches!(input.data, Data::Enum(_)) {
            "ShmSafe requires #[repr(C)], #[repr(transparent)], \
             or #[repr(u8/i8/etc)] for enums\n\
             help: add #[repr(C)] or #[repr(u8)] above this item"
        } else {
            "ShmSafe requires #[repr(C)] or #[repr(transparent)]\n\
             help: add #[repr(C)] above this item"
        };
        return Err(Error::new(input.span(), help_msg));
    }
    Ok(())
}

fn get_field_types(data: &Data) -> syn::Result<Vec<Type>> {
    fn extract_field_types(fields: &Fields) -> Vec<Type> {
        match fields {
            Fields::Named(fields) => fields.named.iter().map(|f| f.ty.clone()).collect(),
            Fields::Unnamed(fields) => fields.unnamed.iter().map(|f| f.ty.clone()).collect(),
            Fields::Unit => Vec::new(),
        }
    }

    match data {
        Data::Struct(data_struct) => Ok(extract_field_types(&data_struct.fields)),

        Data::Enum(data_enum) => Ok(data_enum
            .variants
            .iter()
            .flat_map(|variant| extract_field_types(&variant.fields))
            .collect()),

        Data::Union(u) => Err(Error::new(
            u.union_token.span,
            "ShmSafe cannot be derived for unions",
        )),
    }
}

fn check_types(field_ty: &Type) -> syn::Result<()> {
    // Recursive walker carrying the original field type for error messages.
    fn walk(ty: &Type, field_ty: &Type) -> syn::Result<()> {
        match ty {
            Type::Path(TypePath { path, .. }) => {
                for segment in &path.segments {
                    check_forbidden_type(&segment.ident, field_ty, segment.ident.span())?;

                    match &segment.arguments {
                        PathArguments::AngleBracketed(args) => {
                            for arg in &args.args {
                                if let GenericArgument::Type(inner_ty) = arg {
                                    walk(inner_ty, field_ty)?;
                                }
                            }
                        }
                        PathArguments::Parenthesized(args) => {
                            for input in &args.inputs {
                                walk(input, field_ty)?;
                            }
                            if let ReturnType::Type(_, ret_ty) = &args.output {
                                walk(ret_ty, field_ty)?;
                            }
                        }
                        PathArguments::None => {}
                    }
                }
            }

            Type::Reference(type_ref) => {
                return Err(Error::new(
                    type_ref.span(),
                    format!(
                        "Field type `{}` contains a reference (`&` or `&mut`).\n\
                         References are process-specific and cannot be shared across processes.\n\
                         help: use inline data or atomics instead",
                        quote!(#field_ty),
                    ),
                ));
            }

            Type::Ptr(type_ptr) => {
                return Err(Error::new(
                    type_ptr.span(),
                    format!(
                        "Field type `{}` contains a raw pointer (`*const` or `*mut`).\n\
                         Pointers are process-specific and cannot be shared across processes.\n\
                         help: use inline data or atomics instead",
                        quote!(#field_ty),
                    ),
                ));
            }

            Type::Tuple(tuple) => {
                for elem in &tuple.elems {
                    walk(elem, field_ty)?;
                }
            }

            Type::Array(array) => {
                walk(&array.elem, field_ty)?;
            }

            Type::Slice(slice) => {
                walk(&slice.elem, field_ty)?;
            }

            Type::Group(group) => {
                walk(&group.elem, field_ty)?;
            }

            Type::Paren(paren) => {
                walk(&paren.elem, field_ty)?;
            }

            // Remaining variants either cannot appear as struct fields or
            // carry no type parameters worth inspecting.
            _ => {}
        }

        Ok(())
    }

    walk(field_ty, field_ty)
}

fn check_forbidden_type(
    ident: &Ident,
    field_ty: &Type,
    span: proc_macro2::Span,
) -> syn::Result<()> {
    enum ForbiddenType {
        Heap,
        RefCounted,
        ProcessLocal,
    }

    fn classify_forbidden(ident: &Ident) -> Option<ForbiddenType> {
        const HEAP_TYPES: &[&str] = &["Vec", "Box", "String", "PathBuf", "OsString", "CString"];
        const RC_TYPES: &[&str] = &["Rc", "Arc"];
        const SYNC_TYPES: &[&str] = &["Mutex", "RwLock", "Condvar", "Barrier"];

        if HEAP_TYPES.iter().any(|&name| ident == name) {
            Some(ForbiddenType::Heap)
        } else if RC_TYPES.iter().any(|&name| ident == name) {
            Some(ForbiddenType::RefCounted)
        } else if SYNC_TYPES.iter().any(|&name| ident == name) {
            Some(ForbiddenType::ProcessLocal)
        } else {
            None
        }
    }

    if let Some(category) = classify_forbidden(ident) {
        let msg = match category {
            ForbiddenType::Heap => format!(
                "Field type `{}` contains `{}` which has heap allocation.\n\
                 Shared memory cannot contain pointer types.\n\
                 help: use inline data like `[T; N]` instead of `Vec<T>`, or primitive types",
                quote!(#field_ty),
                ident,
            ),
            ForbiddenType::RefCounted => format!(
                "Field type `{}` contains `{}` which uses reference counting.\n\
                 Shared memory cannot contain pointer types.\n\
                 help: use inline data or atomic types instead",
                quote!(#field_ty),
                ident,
            ),
            ForbiddenType::ProcessLocal => format!(
                "Field type `{}` contains `{}` which is process-local.\n\
                 `std::sync::{}` does not work across process boundaries.\n\
                 help: use atomic types (AtomicU64, AtomicBool, etc.) for cross-process synchronization",
                quote!(#field_ty),
                ident,
                ident,
            ),
        };

        return Err(Error::new(span, msg));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use syn::parse_quote;

    #[test]
    fn check_repr_accepts_repr_c() {
        let input: DeriveInput = parse_quote! {
            #[repr(C)]
            struct Foo {
                x: u32,
            }
        };
        assert!(check_repr(&input).is_ok());
    }

    #[test]
    fn check_repr_accepts_repr_transparent() {
        let input: DeriveInput = parse_quote! {
            #[repr(transparent)]
            struct Foo(u32);
        };
        assert!(check_repr(&input).is_ok());
    }

    #[test]
    fn check_repr_accepts_int_repr_enum() {
        let input: DeriveInput = parse_quote! {
            #[repr(u8)]
            enum Foo {
                A,
                B,
            }
        };
        assert!(check_repr(&input).is_ok());
    }

    #[test]
    fn check_repr_rejects_missing_repr() {
        let input: DeriveInput = parse_quote! {
            struct Foo {
                x: u32,
            }
        };
        assert!(check_repr(&input).is_err());
    }

    #[test]
    fn check_types_accepts_primitives_and_atomics() {
        let ty: Type = parse_quote!(u64);
        assert!(check_types(&ty).is_ok());
        let ty: Type = parse_quote!(AtomicU64);
        assert!(check_types(&ty).is_ok());
        let ty: Type = parse_quote!([u8; 2048]);
        assert!(check_types(&ty).is_ok());
    }

    #[test]
    fn check_types_rejects_heap_types() {
        let ty: Type = parse_quote!(Vec<u8>);
        assert!(check_types(&ty).is_err());
        let ty: Type = parse_quote!(Box<u32>);
        assert!(check_types(&ty).is_err());
        let ty: Type = parse_quote!(String);
        assert!(check_types(&ty).is_err());
    }

    #[test]
    fn check_types_rejects_ref_counting() {
        let ty: Type = parse_quote!(Rc<u32>);
        assert!(check_types(&ty).is_err());
        let ty: Type = parse_quote!(Arc<u32>);
        assert!(check_types(&ty).is_err());
    }

    #[test]
    fn check_types_rejects_pointers_and_references() {
        let ty: Type = parse_quote!(&u32);
        assert!(check_types(&ty).is_err());
        let ty: Type = parse_quote!(&mut u32);
        assert!(check_types(&ty).is_err());
        let ty: Type = parse_quote!(*const u32);
        assert!(check_types(&ty).is_err());
    }

    #[test]
    fn check_types_rejects_nested_forbidden_types() {
        let ty: Type = parse_quote!(Option<Vec<u8>>);
        assert!(check_types(&ty).is_err());
        let ty: Type = parse_quote!([Box<u8>; 4]);
        assert!(check_types(&ty).is_err());
    }

    #[test]
    fn check_types_rejects_process_local_sync() {
        let ty: Type = parse_quote!(Mutex<u64>);
        assert!(check_types(&ty).is_err());
        let ty: Type = parse_quote!(RwLock<u64>);
        assert!(check_types(&ty).is_err());
    }

    #[test]
    fn get_field_types_rejects_unions() {
        let input: DeriveInput = parse_quote! {
            #[repr(C)]
            union Foo {
                a: u32,
                b: f32,
            }
        };
        assert!(get_field_types(&input.data).is_err());
    }
}
