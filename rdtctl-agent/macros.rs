//! Declarative macros to reduce boilerplate across the rdtctl codebase

/// Define a fieldless enum with automatic `name()` and `all()` implementations
///
/// # Example
/// ```
/// use rdtctl::named_enum;
///
/// named_enum! {
///     pub enum Resource {
///         L2 => "L2",
///         L3 => "L3",
///         Mb => "MB",
///     }
/// }
///
/// // Usage
/// let res = Resource::Mb;
/// assert_eq!(res.name(), "MB");
/// assert_eq!(Resource::all().len(), 3);
/// ```
///
/// Expands to:
/// - An enum with Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord derives
/// - A `name(&self) -> &'static str` method
/// - An `all() -> Vec<Self>` method, in declaration order
/// - A `Display` implementation printing `name()`
#[macro_export]
macro_rules! named_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($variant:ident => $str:literal),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        $vis enum $name {
            $($variant,)*
        }

        impl $name {
            pub fn name(&self) -> &'static str {
                match self {
                    $($name::$variant => $str,)*
                }
            }

            pub fn all() -> Vec<$name> {
                vec![$($name::$variant,)*]
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

/// Define an enum with name() and all() methods, plus custom data per variant
///
/// # Example
/// ```
/// use rdtctl::enum_with_data;
///
/// enum_with_data! {
///     pub enum Flavor: &'static str {
///         Unified => ("unified", ""),
///         Code => ("code", "CODE"),
///     }
///     impl suffix -> &'static str
/// }
///
/// let f = Flavor::Code;
/// assert_eq!(f.name(), "code");
/// assert_eq!(f.suffix(), "CODE");
/// ```
#[macro_export]
macro_rules! enum_with_data {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident: $data_type:ty {
            $($variant:ident => ($str:literal, $data:expr)),* $(,)?
        }
        impl $method:ident -> $return_type:ty
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        $vis enum $name {
            $($variant,)*
        }

        impl $name {
            pub fn name(&self) -> &'static str {
                match self {
                    $($name::$variant => $str,)*
                }
            }

            pub fn $method(&self) -> $return_type {
                match self {
                    $($name::$variant => $data,)*
                }
            }

            pub fn all() -> Vec<$name> {
                vec![$($name::$variant,)*]
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

/// Gather metrics from an exporter's registry
///
/// # Example
/// ```ignore
/// // In main.rs metrics handler
/// let mut buffer = Vec::new();
/// gather_metrics!(buffer, encoder, state.exporter, "RDT");
/// ```
#[macro_export]
macro_rules! gather_metrics {
    ($buffer:expr, $encoder:expr, $exporter:expr, $name:literal) => {
        if let Some(ref exporter) = $exporter {
            let metric_families = exporter.registry().gather();
            if let Err(e) = $encoder.encode(&metric_families, &mut $buffer) {
                tracing::error!(concat!("Failed to encode ", $name, " metrics: {}"), e);
            }
        }
    };
}
