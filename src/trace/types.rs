use std::fmt;

/// Element name the tracer records for a tensor argument that was never materialized
pub const UNINITIALIZED_ELEMENT: &str = "nullptr (uninitialized)";

/// Parsed form of a trace type string
///
/// The grammar is small:
///
/// ```text
/// type   := tensor | list | opaque
/// tensor := "Tensor" [ "(" element ")" ]
/// list   := "GenericList[" [ type { "," type } ] "]"
/// opaque := any other text
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeDescriptor {
    /// A tensor, with the element type name when the trace recorded one
    Tensor(Option<String>),
    /// A list of values, one descriptor per element
    List(Vec<TypeDescriptor>),
    /// Anything else (`Int`, `Device`, `Bool`, `None`, ...)
    Opaque(String),
}

impl TypeDescriptor {
    /// Parse a type string; never fails, unknown shapes fall back to `Opaque`
    pub fn parse(text: &str) -> Self {
        let text = text.trim();

        if let Some(rest) = text.strip_prefix("Tensor") {
            let element = match (rest.find('('), rest.rfind(')')) {
                (Some(open), Some(close)) if close > open => {
                    Some(rest[open + 1..close].trim().to_string())
                }
                _ => None,
            };
            return TypeDescriptor::Tensor(element);
        }

        if let Some(inner) = text
            .strip_prefix("GenericList[")
            .and_then(|rest| rest.strip_suffix(']'))
        {
            let elements = split_top_level(inner)
                .into_iter()
                .filter(|part| !part.trim().is_empty())
                .map(TypeDescriptor::parse)
                .collect();
            return TypeDescriptor::List(elements);
        }

        TypeDescriptor::Opaque(text.to_string())
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self, TypeDescriptor::Tensor(_))
    }

    /// A non-empty list whose leading element is a tensor
    pub fn is_tensor_list(&self) -> bool {
        match self {
            TypeDescriptor::List(elements) => {
                matches!(elements.first(), Some(TypeDescriptor::Tensor(_)))
            }
            _ => false,
        }
    }

    /// Element type name of a tensor descriptor
    pub fn element(&self) -> Option<&str> {
        match self {
            TypeDescriptor::Tensor(element) => element.as_deref(),
            _ => None,
        }
    }

    /// Number of tensors this descriptor stands for once nested lists are flattened
    pub fn tensor_count(&self) -> usize {
        match self {
            TypeDescriptor::Tensor(_) => 1,
            TypeDescriptor::List(elements) => elements.iter().map(|e| e.tensor_count()).sum(),
            TypeDescriptor::Opaque(_) => 0,
        }
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeDescriptor::Tensor(Some(element)) => write!(f, "Tensor({})", element),
            TypeDescriptor::Tensor(None) => write!(f, "Tensor"),
            TypeDescriptor::List(elements) => {
                write!(f, "GenericList[")?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", element)?;
                }
                write!(f, "]")
            }
            TypeDescriptor::Opaque(name) => write!(f, "{}", name),
        }
    }
}

/// Split on commas that are not nested inside brackets or parentheses
fn split_top_level(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;

    for (i, c) in text.char_indices() {
        match c {
            '[' | '(' => depth += 1,
            ']' | ')' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}
