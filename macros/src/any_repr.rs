// SPDX-License-Identifier: GPL-3.0-or-later

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput};

pub fn derive(input: TokenStream) -> TokenStream {
	let input = parse_macro_input!(input as DeriveInput);
	let name = &input.ident;
	let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
	if !matches!(input.data, Data::Struct(_)) {
		return syn::Error::new_spanned(&input.ident, "`AnyRepr` can only be derived on structs")
			.to_compile_error()
			.into();
	}
	let expanded = quote! {
		unsafe impl #impl_generics crate::bytes::AnyRepr for #name #ty_generics #where_clause {}
	};
	expanded.into()
}
