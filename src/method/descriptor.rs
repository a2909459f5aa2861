//! Method descriptors and the method being simplified.

use std::{fmt, sync::Arc};

use crate::{Error, Result};

/// A parsed method reference such as `Lcom/example/Foo;->bar(ILjava/lang/String;)V`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSignature {
    /// Defining class descriptor.
    pub class: Arc<str>,
    /// Method name.
    pub name: Arc<str>,
    /// Parameter type descriptors, without the implicit `this`.
    pub parameters: Vec<Arc<str>>,
    /// Return type descriptor.
    pub return_type: Arc<str>,
}

impl MethodSignature {
    /// Parses a smali method reference.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] if the text is not a method reference.
    pub fn parse(descriptor: &str) -> Result<Self> {
        let (class, rest) = descriptor
            .split_once("->")
            .ok_or_else(|| malformed_error!("Missing '->' in method reference {}", descriptor))?;
        let (name, rest) = rest
            .split_once('(')
            .ok_or_else(|| malformed_error!("Missing '(' in method reference {}", descriptor))?;
        let (parameters, return_type) = rest
            .split_once(')')
            .ok_or_else(|| malformed_error!("Missing ')' in method reference {}", descriptor))?;

        if class.is_empty() || name.is_empty() || return_type.is_empty() {
            return Err(malformed_error!("Incomplete method reference {}", descriptor));
        }
        check_type(class)?;
        check_type(return_type)?;

        Ok(MethodSignature {
            class: class.into(),
            name: name.into(),
            parameters: split_types(parameters)?,
            return_type: return_type.into(),
        })
    }

    /// Returns `true` if the method returns nothing.
    #[must_use]
    pub fn returns_void(&self) -> bool {
        &*self.return_type == "V"
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}(", self.class, self.name)?;
        for parameter in &self.parameters {
            f.write_str(parameter)?;
        }
        write!(f, "){}", self.return_type)
    }
}

/// Returns `true` for `J` and `D`, which occupy a register pair.
#[must_use]
pub fn is_wide(descriptor: &str) -> bool {
    matches!(descriptor, "J" | "D")
}

fn check_type(descriptor: &str) -> Result<()> {
    let element = descriptor.trim_start_matches('[');
    let valid = match element.as_bytes().first() {
        Some(b'L') => element.ends_with(';') && element.len() > 2,
        Some(b'Z' | b'B' | b'S' | b'C' | b'I' | b'J' | b'F' | b'D') => element.len() == 1,
        Some(b'V') => element.len() == 1 && element.len() == descriptor.len(),
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(malformed_error!("Invalid type descriptor {}", descriptor))
    }
}

fn split_types(mut list: &str) -> Result<Vec<Arc<str>>> {
    let mut types = Vec::new();
    while !list.is_empty() {
        let dims = list.len() - list.trim_start_matches('[').len();
        let len = match list.as_bytes().get(dims) {
            Some(b'L') => {
                list.find(';')
                    .ok_or_else(|| malformed_error!("Unterminated class type in {}", list))?
                    + 1
            }
            Some(_) => dims + 1,
            None => return Err(malformed_error!("Dangling array marker in {}", list)),
        };
        let (descriptor, rest) = list.split_at(len);
        check_type(descriptor)?;
        if descriptor == "V" {
            return Err(malformed_error!("void parameter in {}", list));
        }
        types.push(descriptor.into());
        list = rest;
    }
    Ok(types)
}

/// The method whose implementation is being executed and simplified.
///
/// Parameters occupy the highest registers of the frame, `this` first for instance methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMethod {
    signature: MethodSignature,
    is_static: bool,
    register_count: u16,
}

impl LocalMethod {
    /// Creates a local method from its reference.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] if `descriptor` can not be parsed or the parameters do
    /// not fit into `register_count` registers.
    pub fn new(descriptor: &str, register_count: u16, is_static: bool) -> Result<Self> {
        let method = LocalMethod {
            signature: MethodSignature::parse(descriptor)?,
            is_static,
            register_count,
        };
        if method.parameter_register_count() > register_count {
            return Err(Error::Error(format!(
                "{} needs {} parameter registers but only has {}",
                descriptor,
                method.parameter_register_count(),
                register_count
            )));
        }
        Ok(method)
    }

    /// Returns the parsed signature.
    #[must_use]
    pub fn signature(&self) -> &MethodSignature {
        &self.signature
    }

    /// Returns `true` for static methods (no `this` register).
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.is_static
    }

    /// Returns the number of registers of the frame.
    #[must_use]
    pub fn register_count(&self) -> u16 {
        self.register_count
    }

    /// Returns how many registers the parameters (including `this`) occupy.
    #[must_use]
    pub fn parameter_register_count(&self) -> u16 {
        let this = u16::from(!self.is_static);
        self.signature
            .parameters
            .iter()
            .map(|parameter| if is_wide(parameter) { 2 } else { 1 })
            .sum::<u16>()
            + this
    }

    /// Returns the parameter registers with their types, in declaration order.
    ///
    /// For wide parameters only the first register of the pair is listed.
    #[must_use]
    pub fn parameter_registers(&self) -> Vec<(u16, Arc<str>)> {
        let mut register = self.register_count - self.parameter_register_count();
        let mut registers = Vec::with_capacity(self.signature.parameters.len() + 1);
        if !self.is_static {
            registers.push((register, Arc::clone(&self.signature.class)));
            register += 1;
        }
        for parameter in &self.signature.parameters {
            registers.push((register, Arc::clone(parameter)));
            register += if is_wide(parameter) { 2 } else { 1 };
        }
        registers
    }
}

impl fmt::Display for LocalMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.signature.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signature() {
        let signature =
            MethodSignature::parse("Lcom/example/Foo;->bar(IJ[Ljava/lang/String;)V").unwrap();
        assert_eq!(&*signature.class, "Lcom/example/Foo;");
        assert_eq!(&*signature.name, "bar");
        assert_eq!(signature.parameters.len(), 3);
        assert_eq!(&*signature.parameters[2], "[Ljava/lang/String;");
        assert!(signature.returns_void());
        assert_eq!(
            signature.to_string(),
            "Lcom/example/Foo;->bar(IJ[Ljava/lang/String;)V"
        );
    }

    #[test]
    fn test_parse_signature_invalid() {
        assert!(MethodSignature::parse("Lcom/example/Foo;.bar()V").is_err());
        assert!(MethodSignature::parse("LFoo;->bar(Q)V").is_err());
        assert!(MethodSignature::parse("LFoo;->bar(V)V").is_err());
        assert!(MethodSignature::parse("LFoo;->bar(LFoo)V").is_err());
    }

    #[test]
    fn test_parameter_registers() {
        let method = LocalMethod::new("LFoo;->bar(JI)V", 6, false).unwrap();
        assert_eq!(method.parameter_register_count(), 4);
        let registers: Vec<u16> = method
            .parameter_registers()
            .iter()
            .map(|(register, _)| *register)
            .collect();
        assert_eq!(registers, vec![2, 3, 5]);

        assert!(LocalMethod::new("LFoo;->bar(JI)V", 3, true).is_err());
    }
}
