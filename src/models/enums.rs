use serde::{Deserialize, Serialize};

/// Error returned when a string does not name a known enum variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid {field} value: {value}")]
pub struct InvalidEnum {
    pub field: String,
    pub value: String,
}

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = InvalidEnum;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }
    };
}

str_enum!(
    /// Who authored a conversation turn.
    MessageRole {
        User => "user",
        Assistant => "assistant",
    }
);

str_enum!(
    /// Which concurrent source delivered a batch of messages.
    DeliverySource {
        Local => "local",
        Subscription => "subscription",
        Poll => "poll",
        Refetch => "refetch",
    }
);

str_enum!(
    /// Why the crisis detector fired. `None` when it did not.
    CrisisReason {
        None => "none",
        Suicide => "suicide",
        SelfHarm => "self_harm",
        Overdose => "overdose",
        ImmediateDanger => "immediate_danger",
        GeneralCrisis => "general_crisis",
    }
);
