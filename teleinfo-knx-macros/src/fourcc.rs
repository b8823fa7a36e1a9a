use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{Error, LitStr, Result};

pub(crate) struct FourccMacro {
    code_str: LitStr,
}

impl Parse for FourccMacro {
    fn parse(input: ParseStream) -> Result<Self> {
        let code_str: LitStr = Parse::parse(input)?;
        let val = code_str.value();
        if val.is_empty() || val.len() > 4 || !val.is_ascii() {
            return Err(Error::new(
                code_str.span(),
                "fourcc literal must be 1 to 4 ASCII characters",
            ));
        }

        Ok(FourccMacro { code_str })
    }
}

impl From<FourccMacro> for proc_macro2::TokenStream {
    fn from(value: FourccMacro) -> Self {
        let code_val = value.code_str.value();

        let mut code = 0u32;
        for c in code_val.bytes() {
            code = (code << 8) | c as u32;
        }
        code <<= 8 * (4 - code_val.len());

        quote! {
            #code
        }
    }
}
