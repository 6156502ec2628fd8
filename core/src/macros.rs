//! Internal declarative macros.

/// Declares a fieldless enum that is persisted as text.
///
/// Generates `as_str`, `parse`, `ALL` and `Display`. The text of each variant
/// must be the `snake_case` form of its name so that serde and the database
/// agree on the representation.
macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $(
                $(#[$vmeta:meta])*
                $variant:ident => $text:literal
            ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
            serde::Serialize, serde::Deserialize,
        )]
        #[serde(rename_all = "snake_case")]
        $vis enum $name {
            $(
                $(#[$vmeta])*
                $variant
            ),+
        }

        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            /// Text representation used in the database and on the wire.
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            /// Parse from the text representation.
            ///
            /// # Errors
            ///
            /// Returns [`StoreError::Decode`](crate::error::StoreError::Decode) if the
            /// string doesn't match a known variant.
            pub fn parse(s: &str) -> Result<Self, crate::error::StoreError> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(crate::error::StoreError::Decode(format!(
                        "Invalid {}: {other}",
                        stringify!($name)
                    ))),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}
