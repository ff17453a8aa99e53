//! Command parameters shared by both wire dialects.
//!
//! A command is a name plus an ordered list of parameters. Optional
//! parameters that are absent (`None`) are left out of the wire form
//! entirely; they never render as an empty field.

use std::fmt;

/// A value that can be sent as one command parameter.
pub trait CommandParam: Sync {
    /// Wire text of the parameter, or `None` to omit it.
    fn to_param(&self) -> Option<String>;
}

macro_rules! display_param {
    ($($ty:ty),*) => {
        $(
            impl CommandParam for $ty {
                fn to_param(&self) -> Option<String> {
                    Some(self.to_string())
                }
            }
        )*
    };
}

display_param!(str, String, char, u8, u16, u32, u64, usize, i8, i16, i32, i64);

impl<T: CommandParam + ?Sized> CommandParam for &T {
    fn to_param(&self) -> Option<String> {
        (**self).to_param()
    }
}

impl<T: CommandParam> CommandParam for Option<T> {
    fn to_param(&self) -> Option<String> {
        self.as_ref().and_then(CommandParam::to_param)
    }
}

/// Render the present parameters in order.
pub fn render_params(params: &[&dyn CommandParam]) -> Vec<String> {
    params.iter().filter_map(|p| p.to_param()).collect()
}

/// Two-digit uppercase hexadecimal, as used for AFI and DSFID values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hex2(pub u8);

impl fmt::Display for Hex2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}", self.0)
    }
}

impl CommandParam for Hex2 {
    fn to_param(&self) -> Option<String> {
        Some(self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_parameters_are_omitted() {
        let missing: Option<&str> = None;
        let params = render_params(&[&missing, &"X", &5u8]);
        assert_eq!(params, vec!["X", "5"]);
    }

    #[test]
    fn nested_options_render_inner_value() {
        let start: Option<u8> = Some(4);
        let min: Option<u8> = None;
        assert_eq!(render_params(&[&start, &min, &Some(15u8)]), vec!["4", "15"]);
    }

    #[test]
    fn hex_parameters_are_two_digits() {
        assert_eq!(render_params(&[&Hex2(0x0a)]), vec!["0A"]);
    }
}
