use std::fmt::Write as _;
use std::{fmt, fmt::Display};

use crate::contract::{CodecSetup, CodecSetupValue, ParameterMap};

pub const DEFAULT_ORDER: i32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterType {
    StringList,
    IntegerRange,
    DoubleRange,
}

impl Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StringList => f.write_str("STRING_LIST"),
            Self::IntegerRange => f.write_str("INTEGER_RANGE"),
            Self::DoubleRange => f.write_str("DOUBLE_RANGE"),
        }
    }
}

/// Type, accepted values and default of a parameter. An empty
/// `valid_values` list accepts any string.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParameterKind {
    StringList {
        valid_values: &'static [&'static str],
        default: &'static str,
    },
    IntegerRange {
        min: i32,
        max: i32,
        default: i32,
    },
    DoubleRange {
        min: f64,
        max: f64,
        default: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: ParameterKind,
    /// `(requires_param, requires_value)`.
    pub requires: Option<(&'static str, &'static str)>,
    pub order: i32,
}

impl ParameterDescriptor {
    #[must_use]
    pub const fn string_list(
        name: &'static str,
        description: &'static str,
        valid_values: &'static [&'static str],
        default: &'static str,
    ) -> Self {
        Self {
            name,
            description,
            kind: ParameterKind::StringList {
                valid_values,
                default,
            },
            requires: None,
            order: DEFAULT_ORDER,
        }
    }

    #[must_use]
    pub const fn integer(
        name: &'static str,
        description: &'static str,
        min: i32,
        max: i32,
        default: i32,
    ) -> Self {
        Self {
            name,
            description,
            kind: ParameterKind::IntegerRange { min, max, default },
            requires: None,
            order: DEFAULT_ORDER,
        }
    }

    #[must_use]
    pub const fn double(
        name: &'static str,
        description: &'static str,
        min: f64,
        max: f64,
        default: f64,
    ) -> Self {
        Self {
            name,
            description,
            kind: ParameterKind::DoubleRange { min, max, default },
            requires: None,
            order: DEFAULT_ORDER,
        }
    }

    #[must_use]
    pub const fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    #[must_use]
    pub const fn requires(mut self, param: &'static str, value: &'static str) -> Self {
        self.requires = Some((param, value));
        self
    }

    #[must_use]
    pub fn parameter_type(&self) -> ParameterType {
        match self.kind {
            ParameterKind::StringList { .. } => ParameterType::StringList,
            ParameterKind::IntegerRange { .. } => ParameterType::IntegerRange,
            ParameterKind::DoubleRange { .. } => ParameterType::DoubleRange,
        }
    }

    #[must_use]
    pub fn default_value(&self) -> CodecSetupValue {
        match self.kind {
            ParameterKind::StringList { default, .. } => CodecSetupValue::from(default),
            ParameterKind::IntegerRange { default, .. } => CodecSetupValue::Int(default),
            ParameterKind::DoubleRange { default, .. } => CodecSetupValue::Double(default),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelpVerbosity {
    Compact,
    Concise,
    Verbose,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParameterError {
    #[error("{codec}: Invalid parameter format '{pair}'. Expected format: key=value")]
    MalformedPair { codec: String, pair: String },
    #[error("{codec}: Unknown parameter '{key}'. Run '--{codec} help' for available parameters")]
    UnknownParameter { codec: String, key: String },
    #[error("{codec}: Invalid {name} '{value}'. Valid values are: {}", .valid.join(", "))]
    NotInList {
        codec: String,
        name: String,
        value: String,
        valid: Vec<String>,
    },
    #[error("{codec}: Invalid value '{value}' for parameter '{name}'. Valid range: {min}-{max}")]
    OutOfRange {
        codec: String,
        name: String,
        value: String,
        min: String,
        max: String,
    },
    #[error("{codec}: Invalid integer value for parameter '{name}': '{value}'")]
    NotAnInteger {
        codec: String,
        name: String,
        value: String,
    },
    #[error("{codec}: Invalid numeric value for parameter '{name}': '{value}'")]
    NotANumber {
        codec: String,
        name: String,
        value: String,
    },
    #[error("{codec}: Parameter '{name}' requires '{required}' to be set")]
    MissingDependency {
        codec: String,
        name: String,
        required: String,
    },
    #[error(
        "{codec}: Cannot use '{name}' when {required}={actual}. Parameter '{name}' requires: {required}={expected}"
    )]
    DependencyMismatch {
        codec: String,
        name: String,
        required: String,
        expected: String,
        actual: String,
    },
    #[error("parameter '{name}' holds a {actual} value, not {expected}")]
    WrongVariant {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("no descriptor for parameter '{0}'")]
    NoDescriptor(String),
}

fn find<'d>(descriptors: &'d [ParameterDescriptor], name: &str) -> Option<&'d ParameterDescriptor> {
    descriptors.iter().find(|descriptor| descriptor.name == name)
}

/// Parses `key=value` pairs separated by `:` (when the string contains
/// one) or `,`, validating each pair against `descriptors`.
pub fn parse_parameter_string(
    codec: &str,
    raw: &str,
    descriptors: &[ParameterDescriptor],
    setup: &mut CodecSetup,
) -> Result<(), ParameterError> {
    let delimiter = if raw.contains(':') { ':' } else { ',' };
    for pair in raw.split(delimiter).map(str::trim) {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| ParameterError::MalformedPair {
                codec: codec.to_string(),
                pair: pair.to_string(),
            })?;
        let (key, value) = (key.trim(), value.trim());
        let descriptor = find(descriptors, key).ok_or_else(|| ParameterError::UnknownParameter {
            codec: codec.to_string(),
            key: key.to_string(),
        })?;
        validate_and_set_parameter(codec, key, value, descriptor, setup)?;
    }
    Ok(())
}

pub fn validate_and_set_parameter(
    codec: &str,
    name: &str,
    value: &str,
    descriptor: &ParameterDescriptor,
    setup: &mut CodecSetup,
) -> Result<(), ParameterError> {
    match descriptor.kind {
        ParameterKind::StringList { valid_values, .. } => {
            if !valid_values.is_empty() && !valid_values.contains(&value) {
                return Err(ParameterError::NotInList {
                    codec: codec.to_string(),
                    name: name.to_string(),
                    value: value.to_string(),
                    valid: valid_values.iter().map(|v| v.to_string()).collect(),
                });
            }
            setup.set(name, value);
        }
        ParameterKind::IntegerRange { min, max, .. } => {
            let parsed = value
                .parse::<i32>()
                .map_err(|_| ParameterError::NotAnInteger {
                    codec: codec.to_string(),
                    name: name.to_string(),
                    value: value.to_string(),
                })?;
            if !(min..=max).contains(&parsed) {
                return Err(ParameterError::OutOfRange {
                    codec: codec.to_string(),
                    name: name.to_string(),
                    value: parsed.to_string(),
                    min: min.to_string(),
                    max: max.to_string(),
                });
            }
            setup.set(name, parsed);
        }
        ParameterKind::DoubleRange { min, max, .. } => {
            let parsed = value
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| ParameterError::NotANumber {
                    codec: codec.to_string(),
                    name: name.to_string(),
                    value: value.to_string(),
                })?;
            if parsed < min || parsed > max {
                return Err(ParameterError::OutOfRange {
                    codec: codec.to_string(),
                    name: name.to_string(),
                    value: format!("{parsed:.2}"),
                    min: format!("{min:.2}"),
                    max: format!("{max:.2}"),
                });
            }
            setup.set(name, parsed);
        }
    }
    Ok(())
}

/// Every set parameter carrying a dependency needs its target set, and
/// equal to the required value when the target holds a string.
pub fn validate_dependencies(
    codec: &str,
    descriptors: &[ParameterDescriptor],
    setup: &CodecSetup,
) -> Result<(), ParameterError> {
    for name in setup.parameter_map.keys() {
        let Some((required, expected)) = find(descriptors, name).and_then(|d| d.requires) else {
            continue;
        };
        match setup.parameter_map.get(required) {
            None => {
                return Err(ParameterError::MissingDependency {
                    codec: codec.to_string(),
                    name: name.clone(),
                    required: required.to_string(),
                });
            }
            Some(CodecSetupValue::Str(actual)) if actual != expected => {
                return Err(ParameterError::DependencyMismatch {
                    codec: codec.to_string(),
                    name: name.clone(),
                    required: required.to_string(),
                    expected: expected.to_string(),
                    actual: actual.clone(),
                });
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Descriptors in display order: ascending `order`, ties alphabetical.
#[must_use]
pub fn sorted_descriptors(descriptors: &[ParameterDescriptor]) -> Vec<&ParameterDescriptor> {
    let mut sorted = descriptors.iter().collect::<Vec<_>>();
    sorted.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.name.cmp(b.name)));
    sorted
}

/// Parameter map entries in display order; names without a descriptor
/// sort with the default order.
#[must_use]
pub fn sorted_parameters(
    descriptors: &[ParameterDescriptor],
    parameters: &ParameterMap,
) -> Vec<(String, String)> {
    let order_of = |name: &str| find(descriptors, name).map_or(DEFAULT_ORDER, |d| d.order);
    let mut sorted = parameters
        .iter()
        .map(|(name, value)| (name.clone(), value.to_string()))
        .collect::<Vec<_>>();
    sorted.sort_by(|a, b| {
        order_of(&a.0)
            .cmp(&order_of(&b.0))
            .then_with(|| a.0.cmp(&b.0))
    });
    sorted
}

/// Renders a parameter map back into the `key=value:key=value` grammar.
/// Doubles keep full precision. Values containing `:` do not parse back.
#[must_use]
pub fn format_parameters(descriptors: &[ParameterDescriptor], parameters: &ParameterMap) -> String {
    let mut rendered = sorted_parameters(descriptors, parameters)
        .into_iter()
        .map(|(name, shown)| match parameters.get(&name) {
            Some(CodecSetupValue::Double(value)) => format!("{name}={value}"),
            _ => format!("{name}={shown}"),
        })
        .collect::<Vec<_>>()
        .join(":");
    // A lone pair holding ',' needs a ':' to select that delimiter.
    if rendered.contains(',') && !rendered.contains(':') {
        rendered.push(':');
    }
    rendered
}

fn usage_example(codec: &str) -> &'static str {
    match codec {
        "x265" => "optimization=opt:preset=ultrafast:qp=30",
        "webp" => "optimization=opt:quality=90:method=6",
        "libjpegturbo" => "optimization=opt:quality=90",
        "svtav1" => "preset=8:qp=35",
        "jpegli" => "quality=75",
        _ => "param1=value1:param2=value2",
    }
}

fn compact_range(kind: &ParameterKind) -> String {
    match kind {
        ParameterKind::StringList { valid_values, .. } => format!("{{{}}}", valid_values.join("|")),
        ParameterKind::IntegerRange { min, max, .. } => format!("{min}-{max}"),
        ParameterKind::DoubleRange { min, max, .. } => format!("{min:.2}-{max:.2}"),
    }
}

fn render_compact(out: &mut String, codec: &str, descriptors: &[ParameterDescriptor]) -> fmt::Result {
    let entries = sorted_descriptors(descriptors)
        .into_iter()
        .map(|d| format!("{}={}", d.name, compact_range(&d.kind)))
        .collect::<Vec<_>>();
    writeln!(out, "{codec} parameters: {}", entries.join(", "))
}

fn render_concise(out: &mut String, codec: &str, descriptors: &[ParameterDescriptor]) -> fmt::Result {
    const INDENT: &str = "                  ";
    writeln!(out, "Available parameters for {codec}:")?;
    writeln!(out)?;
    for descriptor in sorted_descriptors(descriptors) {
        writeln!(out, "  {:<15} {}", descriptor.name, descriptor.description)?;
        let default = descriptor.default_value();
        match descriptor.kind {
            ParameterKind::StringList { valid_values, .. } => writeln!(
                out,
                "{INDENT}Values: {} (default: {default})",
                valid_values.join(", ")
            )?,
            ParameterKind::IntegerRange { min, max, .. } => {
                writeln!(out, "{INDENT}Range: {min}-{max} (default: {default})")?
            }
            ParameterKind::DoubleRange { min, max, .. } => {
                writeln!(out, "{INDENT}Range: {min:.2}-{max:.2} (default: {default})")?
            }
        }
        if let Some((param, value)) = descriptor.requires {
            writeln!(out, "{INDENT}Note: Requires {param}={value}")?;
        }
        writeln!(out)?;
    }
    writeln!(out, "Usage: --{codec} param=value:param=value:...")?;
    writeln!(out, "   or: --{codec} param=value --{codec} param=value ...")?;
    writeln!(out, "Example: --{codec} {}", usage_example(codec))
}

fn render_verbose(out: &mut String, codec: &str, descriptors: &[ParameterDescriptor]) -> fmt::Result {
    writeln!(out, "{codec} Encoder Parameters")?;
    writeln!(out, "=======================")?;
    writeln!(out)?;
    for descriptor in sorted_descriptors(descriptors) {
        writeln!(
            out,
            "{} ({})",
            descriptor.description.to_uppercase(),
            descriptor.name
        )?;
        writeln!(out, "  Description: {}", descriptor.description)?;
        match descriptor.kind {
            ParameterKind::StringList { valid_values, .. } => {
                writeln!(out, "  Type: String (choice)")?;
                writeln!(out, "  Valid values:")?;
                for value in valid_values {
                    writeln!(out, "    - {value}")?;
                }
            }
            ParameterKind::IntegerRange { min, max, .. } => {
                writeln!(out, "  Type: Integer")?;
                writeln!(out, "  Range: {min} to {max}")?;
            }
            ParameterKind::DoubleRange { min, max, .. } => {
                writeln!(out, "  Type: Numeric")?;
                writeln!(out, "  Range: {min:.2} to {max:.2}")?;
            }
        }
        writeln!(out, "  Default: {}", descriptor.default_value())?;
        if let Some((param, value)) = descriptor.requires {
            writeln!(out, "  Requires: {param}={value}")?;
        }
        writeln!(out)?;
    }
    writeln!(out, "USAGE")?;
    writeln!(out, "-----")?;
    writeln!(out, "--{codec} param=value:param=value:...")?;
    writeln!(out, "--{codec} param=value --{codec} param=value ...")?;
    writeln!(out)?;
    writeln!(out, "EXAMPLE")?;
    writeln!(out, "-------")?;
    writeln!(out, "--{codec} {}", usage_example(codec))?;
    writeln!(out)
}

#[must_use]
pub fn render_parameter_help(
    codec: &str,
    descriptors: &[ParameterDescriptor],
    verbosity: HelpVerbosity,
) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = match verbosity {
        HelpVerbosity::Compact => render_compact(&mut out, codec, descriptors),
        HelpVerbosity::Concise => render_concise(&mut out, codec, descriptors),
        HelpVerbosity::Verbose => render_verbose(&mut out, codec, descriptors),
    };
    out
}

pub fn print_parameter_help(
    codec: &str,
    descriptors: &[ParameterDescriptor],
    verbosity: HelpVerbosity,
) {
    print!("{}", render_parameter_help(codec, descriptors, verbosity));
}
