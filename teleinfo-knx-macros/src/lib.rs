//! Base library to define TeleInfo procedural macros

#![warn(missing_docs)]

mod fourcc;

use crate::fourcc::FourccMacro;
use proc_macro::TokenStream;
use syn::parse_macro_input;

/// Macro to pack a short ASCII literal into the `u32` code used to compare
/// TeleInfo enumeration payloads
///
/// The first character lands in the most significant byte; missing low
/// bytes stay zero, so a 3-character literal can be compared against a
/// 4-byte payload masked with `0xffff_ff00`.
///
/// ```
/// use teleinfo_knx_macros::fourcc;
///
/// assert_eq!(0x54482E2Eu32, fourcc!("TH.."));
/// assert_eq!(0x42415300u32, fourcc!("BAS"));
/// ```
#[proc_macro]
pub fn fourcc(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as FourccMacro);
    let output: proc_macro2::TokenStream = input.into();
    output.into()
}
