// SPDX-License-Identifier: GPL-3.0-or-later

//! Derive macros used by the `oefs` crate.

#![deny(warnings)]

extern crate proc_macro;

mod any_repr;

use proc_macro::TokenStream;

/// Marks a `#[repr(C)]` struct as plain-old-data: any bit pattern of the right size is a valid
/// value, so blocks read off a device can be reinterpreted as the type without validation beyond
/// its size.
///
/// This is the on-disk/on-wire counterpart to `bytemuck::Pod`, kept as a dedicated derive so the
/// structures this crate maps onto raw blocks (superblock, inode, block group descriptor, host
/// transport argument records, ...) stay self-documenting about why `unsafe` is sound here: the
/// struct has no padding-sensitive invariants, no pointers, and no enum discriminants.
#[proc_macro_derive(AnyRepr)]
pub fn derive_any_repr(input: TokenStream) -> TokenStream {
	any_repr::derive(input)
}
