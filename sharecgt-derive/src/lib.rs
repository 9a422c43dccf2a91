use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Attribute, Data, DeriveInput, Fields, Lit, LitStr, Meta, Type};

/// Derive macro describing the CSV layout of a record type.
///
/// For each named field it collects:
/// - the column name (honours `#[serde(rename = "...")]`)
/// - whether the column is required (anything but `Option<T>`)
/// - a description taken from the doc comment
/// - an optional sample value from `#[csv(example = "...")]`
///
/// Fields marked `#[serde(skip)]` are left out. Generates
/// `csv_schema() -> &'static [CsvField]` and `csv_header() -> String`.
#[proc_macro_derive(CsvSchema, attributes(csv, serde))]
pub fn derive_csv_schema(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            _ => {
                return syn::Error::new_spanned(name, "CsvSchema needs named fields")
                    .to_compile_error()
                    .into()
            }
        },
        _ => {
            return syn::Error::new_spanned(name, "CsvSchema only supports structs")
                .to_compile_error()
                .into()
        }
    };

    let mut columns = Vec::new();
    for field in fields {
        let serde = match serde_attrs(&field.attrs) {
            Ok(serde) => serde,
            Err(err) => return err.to_compile_error().into(),
        };
        if serde.skip {
            continue;
        }
        let example = match csv_example(&field.attrs) {
            Ok(example) => example,
            Err(err) => return err.to_compile_error().into(),
        };
        let column = serde.rename.unwrap_or_else(|| {
            field
                .ident
                .as_ref()
                .map(|ident| ident.to_string())
                .unwrap_or_default()
        });
        columns.push(Column {
            name: column,
            required: !is_option_type(&field.ty),
            description: doc_comment(&field.attrs),
            example,
        });
    }

    let entries = columns.iter().map(|c| {
        let Column {
            name,
            required,
            description,
            example,
        } = c;
        let example = match example {
            Some(e) => quote! { Some(#e) },
            None => quote! { None },
        };
        quote! {
            crate::core::schema::CsvField {
                name: #name,
                required: #required,
                description: #description,
                example: #example,
            }
        }
    });
    let header = columns
        .iter()
        .map(|c| c.name.as_str())
        .collect::<Vec<_>>()
        .join(",");

    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let expanded = quote! {
        impl #impl_generics #name #ty_generics #where_clause {
            pub fn csv_schema() -> &'static [crate::core::schema::CsvField] {
                static SCHEMA: &[crate::core::schema::CsvField] = &[
                    #(#entries),*
                ];
                SCHEMA
            }

            pub fn csv_header() -> String {
                #header.to_string()
            }
        }
    };

    TokenStream::from(expanded)
}

struct Column {
    name: String,
    required: bool,
    description: String,
    example: Option<String>,
}

#[derive(Default)]
struct SerdeAttrs {
    rename: Option<String>,
    skip: bool,
}

fn serde_attrs(attrs: &[Attribute]) -> syn::Result<SerdeAttrs> {
    let mut out = SerdeAttrs::default();
    for attr in attrs.iter().filter(|a| a.path().is_ident("serde")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("rename") {
                let value: LitStr = meta.value()?.parse()?;
                out.rename = Some(value.value());
            } else if meta.path.is_ident("skip") || meta.path.is_ident("skip_serializing") {
                out.skip = true;
            } else if meta.input.peek(syn::Token![=]) {
                // other serde keys (default = "...", with = "...") are irrelevant here
                let _: Lit = meta.value()?.parse()?;
            } else if meta.input.peek(syn::token::Paren) {
                let content;
                syn::parenthesized!(content in meta.input);
                content.parse::<proc_macro2::TokenStream>()?;
            }
            Ok(())
        })?;
    }
    Ok(out)
}

fn csv_example(attrs: &[Attribute]) -> syn::Result<Option<String>> {
    let mut example = None;
    for attr in attrs.iter().filter(|a| a.path().is_ident("csv")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("example") {
                let value: LitStr = meta.value()?.parse()?;
                example = Some(value.value());
                Ok(())
            } else {
                Err(meta.error("unsupported csv attribute, expected `example`"))
            }
        })?;
    }
    Ok(example)
}

fn doc_comment(attrs: &[Attribute]) -> String {
    attrs
        .iter()
        .filter(|attr| attr.path().is_ident("doc"))
        .filter_map(|attr| match &attr.meta {
            Meta::NameValue(meta) => match &meta.value {
                syn::Expr::Lit(expr_lit) => match &expr_lit.lit {
                    Lit::Str(s) => Some(s.value().trim().to_string()),
                    _ => None,
                },
                _ => None,
            },
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_option_type(ty: &Type) -> bool {
    match ty {
        Type::Path(type_path) => type_path
            .path
            .segments
            .last()
            .is_some_and(|segment| segment.ident == "Option"),
        _ => false,
    }
}
