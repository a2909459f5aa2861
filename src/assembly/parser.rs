//! Smali text parsing into a [`MethodImplementation`].
//!
//! The accepted syntax is the method-body subset of smali: one instruction per line,
//! `:name` label definitions, a `.registers N` directive and `.catch` / `.catchall`
//! directives. Lines starting with `#` are comments.
//!
//! Branch references of the form `:addr_<hex>` that are not defined as explicit labels
//! resolve to the instruction starting at that code address. This is the form
//! [`crate::assembly::Instruction::render`] produces, so rendered method bodies can be
//! parsed back.
//!
//! # Examples
//!
//! ```rust
//! use dexscope::assembly::parse_smali;
//!
//! let implementation = parse_smali(
//!     "
//!     .registers 1
//!     const/4 v0, 0x0
//!     if-eqz v0, :done
//!     const/4 v0, 0x1
//!     :done
//!     return v0
//!     ",
//! )?;
//! assert_eq!(implementation.len(), 4);
//! assert_eq!(implementation.register_count(), 1);
//! # Ok::<(), dexscope::Error>(())
//! ```

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::{
    assembly::{Format, Instruction, Opcode, Operand},
    method::{LabelId, MethodImplementation, TryBlock},
    Error, Result,
};

/// Parses a smali method body.
///
/// # Errors
///
/// Returns [`Error::Malformed`] for syntax errors, unknown opcodes, undefined labels or a
/// missing `.registers` directive, and [`Error::Empty`] if the body has no instructions.
pub fn parse_smali(text: &str) -> Result<MethodImplementation> {
    SmaliParser::default().parse(text)
}

struct PendingTry {
    exception_type: Option<Arc<str>>,
    start: LabelId,
    end: LabelId,
    handler: LabelId,
}

#[derive(Default)]
struct SmaliParser {
    register_count: Option<u16>,
    instructions: Vec<Instruction>,
    labels: FxHashMap<String, LabelId>,
    /// Named label definitions, as (label, index of the following instruction).
    definitions: Vec<(LabelId, usize)>,
    tries: Vec<PendingTry>,
    next_label: u32,
}

impl SmaliParser {
    fn parse(mut self, text: &str) -> Result<MethodImplementation> {
        for (number, raw) in text.lines().enumerate() {
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }
            self.parse_line(line)
                .map_err(|error| annotate(error, number + 1))?;
        }

        if self.instructions.is_empty() {
            return Err(Error::Empty);
        }
        let register_count = self
            .register_count
            .ok_or_else(|| malformed_error!("Missing .registers directive"))?;

        let mut implementation = MethodImplementation::new(register_count);
        // Labels are numbered in order of first use, mirror that in the implementation.
        for _ in 0..self.next_label {
            implementation.new_label();
        }

        let locations: Vec<_> = self
            .instructions
            .into_iter()
            .map(|instruction| implementation.push(instruction))
            .collect();

        let mut defined = vec![false; self.next_label as usize];
        for (label, index) in &self.definitions {
            let location = locations
                .get(*index)
                .copied()
                .unwrap_or(implementation.end_location());
            implementation.place_label(*label, location)?;
            defined[label.index()] = true;
        }

        for (name, label) in &self.labels {
            if defined[label.index()] {
                continue;
            }
            let address = name
                .strip_prefix("addr_")
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .ok_or_else(|| malformed_error!("Undefined label :{}", name))?;
            let location = if address == implementation.end_address() {
                implementation.end_location()
            } else {
                implementation
                    .location_at(address)
                    .ok_or_else(|| malformed_error!("No instruction at :{}", name))?
            };
            implementation.place_label(*label, location)?;
        }

        for pending in self.tries {
            implementation.add_try_block(TryBlock {
                start: pending.start,
                end: pending.end,
                handler: pending.handler,
                exception_type: pending.exception_type,
            });
        }

        implementation.normalize()?;
        Ok(implementation)
    }

    fn parse_line(&mut self, line: &str) -> Result<()> {
        if let Some(name) = line.strip_prefix(':') {
            let label = self.label(name)?;
            if self.definitions.iter().any(|(defined, _)| *defined == label) {
                return Err(malformed_error!("Label :{} defined twice", name));
            }
            self.definitions.push((label, self.instructions.len()));
            return Ok(());
        }

        if let Some(rest) = line.strip_prefix(".registers") {
            let count = rest
                .trim()
                .parse::<u16>()
                .map_err(|_| malformed_error!("Invalid register count '{}'", rest.trim()))?;
            self.register_count = Some(count);
            return Ok(());
        }
        if let Some(rest) = line.strip_prefix(".catchall") {
            return self.parse_catch(None, rest);
        }
        if let Some(rest) = line.strip_prefix(".catch") {
            let rest = rest.trim_start();
            let (exception_type, range) = rest
                .split_once(char::is_whitespace)
                .ok_or_else(|| malformed_error!("Incomplete .catch directive"))?;
            return self.parse_catch(Some(exception_type.into()), range);
        }
        if line.starts_with('.') {
            return Err(malformed_error!("Unsupported directive '{}'", line));
        }

        let (mnemonic, rest) = line
            .split_once(char::is_whitespace)
            .map_or((line, ""), |(mnemonic, rest)| (mnemonic, rest.trim()));
        let opcode: Opcode = mnemonic
            .parse()
            .map_err(|_| malformed_error!("Unknown opcode '{}'", mnemonic))?;

        let operands = match opcode.format() {
            Format::PackedSwitchPayload => self.parse_packed_payload(rest)?,
            Format::SparseSwitchPayload => self.parse_sparse_payload(rest)?,
            Format::ArrayPayload => parse_array_payload(rest)?,
            _ => split_operands(rest)?
                .into_iter()
                .map(|token| self.operand(token))
                .collect::<Result<Vec<_>>>()?,
        };
        self.instructions.push(Instruction::new(opcode, operands)?);
        Ok(())
    }

    /// `{:start .. :end} :handler`
    fn parse_catch(&mut self, exception_type: Option<Arc<str>>, text: &str) -> Result<()> {
        let text = text.trim();
        let inner = text
            .strip_prefix('{')
            .and_then(|rest| rest.split_once('}'))
            .ok_or_else(|| malformed_error!("Expected a '{:start .. :end}' range in catch directive"))?;
        let (range, handler) = inner;
        let (start, end) = range
            .split_once("..")
            .ok_or_else(|| malformed_error!("Expected '..' in catch range"))?;

        let start = self.label_ref(start.trim())?;
        let end = self.label_ref(end.trim())?;
        let handler = self.label_ref(handler.trim())?;
        self.tries.push(PendingTry {
            exception_type,
            start,
            end,
            handler,
        });
        Ok(())
    }

    /// `0x0 :a, :b`
    fn parse_packed_payload(&mut self, text: &str) -> Result<Vec<Operand>> {
        let (key, targets) = text
            .split_once(char::is_whitespace)
            .map_or((text, ""), |(key, targets)| (key, targets.trim()));
        let first_key = i32::try_from(parse_literal(key)?)
            .map_err(|_| malformed_error!("Switch key {} out of range", key))?;
        let targets = split_operands(targets)?
            .into_iter()
            .map(|token| self.label_ref(token))
            .collect::<Result<Vec<_>>>()?;
        Ok(vec![Operand::PackedTargets { first_key, targets }])
    }

    /// `0x1 -> :a, 0x5 -> :b`
    fn parse_sparse_payload(&mut self, text: &str) -> Result<Vec<Operand>> {
        let entries = split_operands(text)?
            .into_iter()
            .map(|entry| {
                let (key, target) = entry
                    .split_once("->")
                    .ok_or_else(|| malformed_error!("Expected 'key -> :label', got '{}'", entry))?;
                let key = i32::try_from(parse_literal(key.trim())?)
                    .map_err(|_| malformed_error!("Switch key {} out of range", key))?;
                Ok((key, self.label_ref(target.trim())?))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(vec![Operand::SparseTargets(entries)])
    }

    fn operand(&mut self, token: &str) -> Result<Operand> {
        if token.starts_with(':') {
            return Ok(Operand::Label(self.label_ref(token)?));
        }
        if let Some(register) = parse_register(token) {
            return Ok(Operand::Register(register?));
        }
        if let Some(list) = token.strip_prefix('{') {
            let list = list
                .strip_suffix('}')
                .ok_or_else(|| malformed_error!("Unterminated register list '{}'", token))?;
            let registers = split_operands(list)?
                .into_iter()
                .map(|register| {
                    parse_register(register)
                        .unwrap_or_else(|| Err(malformed_error!("Expected register, got '{}'", register)))
                })
                .collect::<Result<Vec<_>>>()?;
            return Ok(Operand::RegisterList(registers));
        }
        if token.starts_with('"') {
            return Ok(Operand::String(unescape(token)?.into()));
        }
        if token.contains("->") {
            return Ok(if token.contains('(') {
                Operand::Method(token.into())
            } else {
                Operand::Field(token.into())
            });
        }
        if token.starts_with('L') || token.starts_with('[') {
            return Ok(Operand::Type(token.into()));
        }
        Ok(Operand::Literal(parse_literal(token)?))
    }

    fn label_ref(&mut self, token: &str) -> Result<LabelId> {
        let name = token
            .strip_prefix(':')
            .ok_or_else(|| malformed_error!("Expected label, got '{}'", token))?;
        self.label(name)
    }

    fn label(&mut self, name: &str) -> Result<LabelId> {
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(malformed_error!("Invalid label name '{}'", name));
        }
        if let Some(label) = self.labels.get(name) {
            return Ok(*label);
        }
        let label = LabelId::new(self.next_label);
        self.next_label += 1;
        self.labels.insert(name.to_string(), label);
        Ok(label)
    }
}

fn annotate(error: Error, line: usize) -> Error {
    match error {
        Error::Malformed {
            message,
            file,
            line: source_line,
        } => Error::Malformed {
            message: format!("line {line}: {message}"),
            file,
            line: source_line,
        },
        other => other,
    }
}

/// `4 0x1, 0x2`
fn parse_array_payload(text: &str) -> Result<Vec<Operand>> {
    let (width, elements) = text
        .split_once(char::is_whitespace)
        .map_or((text, ""), |(width, elements)| (width, elements.trim()));
    let element_width = width
        .parse::<u16>()
        .map_err(|_| malformed_error!("Invalid element width '{}'", width))?;
    let elements = split_operands(elements)?
        .into_iter()
        .map(parse_literal)
        .collect::<Result<Vec<_>>>()?;
    Ok(vec![Operand::ArrayData {
        element_width,
        elements,
    }])
}

fn parse_register(token: &str) -> Option<Result<u16>> {
    let digits = token.strip_prefix('v')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(
        digits
            .parse::<u16>()
            .map_err(|_| malformed_error!("Register '{}' out of range", token)),
    )
}

fn parse_literal(token: &str) -> Result<i64> {
    let (negative, digits) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token),
    };
    let magnitude = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => digits.parse::<u64>(),
    }
    .map_err(|_| malformed_error!("Invalid literal '{}'", token))?;

    let value = i64::try_from(magnitude)
        .map_err(|_| malformed_error!("Literal '{}' out of range", token))?;
    Ok(if negative { -value } else { value })
}

/// Splits on commas outside of quotes and braces.
fn split_operands(text: &str) -> Result<Vec<&str>> {
    let mut tokens = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut start = 0;

    for (position, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| malformed_error!("Unbalanced '}}' in '{}'", text))?;
            }
            ',' if depth == 0 => {
                tokens.push(text[start..position].trim());
                start = position + 1;
            }
            _ => {}
        }
    }
    if in_string || depth != 0 {
        return Err(malformed_error!("Unterminated operand in '{}'", text));
    }

    let last = text[start..].trim();
    if !last.is_empty() || !tokens.is_empty() {
        tokens.push(last);
    }
    if tokens.iter().any(|token| token.is_empty()) {
        return Err(malformed_error!("Empty operand in '{}'", text));
    }
    Ok(tokens)
}

fn unescape(token: &str) -> Result<String> {
    let inner = token
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .ok_or_else(|| malformed_error!("Invalid string literal {}", token))?;

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            other => return Err(malformed_error!("Invalid escape \\{:?} in {}", other, token)),
        }
    }
    Ok(out)
}

fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    let mut escaped = false;
    for (position, c) in line.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..position],
            _ => {}
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_labels_and_addresses() {
        let implementation = parse_smali(
            "
            .registers 2
            const/16 v0, 0x100     # two code units
            :loop
            add-int/lit8 v0, v0, -0x1
            if-nez v0, :loop
            return-void
            ",
        )
        .unwrap();

        let branch = implementation.location_at(4).unwrap();
        let instruction = implementation.instruction(branch).unwrap();
        assert_eq!(instruction.opcode(), Opcode::IfNez);
        let target = implementation
            .label_location(instruction.target().unwrap())
            .unwrap();
        assert_eq!(implementation.code_address(target), Some(2));
        assert_eq!(
            implementation.render_instruction(branch).unwrap(),
            "if-nez v0, :addr_2"
        );
    }

    #[test]
    fn test_parse_address_labels() {
        let implementation = parse_smali(
            "
            .registers 1
            goto :addr_2
            nop
            return-void
            ",
        )
        .unwrap();
        let goto = implementation.location_at(0).unwrap();
        let target = implementation
            .label_location(implementation.instruction(goto).unwrap().target().unwrap())
            .unwrap();
        assert_eq!(implementation.code_address(target), Some(2));
    }

    #[test]
    fn test_parse_switch_payload() {
        let implementation = parse_smali(
            "
            .registers 1
            packed-switch v0, :table
            :case0
            return-void
            :case1
            return-void
            nop
            :table
            packed-switch-payload 0x0 :case0, :case1
            ",
        )
        .unwrap();
        let payload = implementation.location_at(6).unwrap();
        assert_eq!(
            implementation.render_instruction(payload).unwrap(),
            "packed-switch-payload 0x0 :addr_3, :addr_4"
        );
    }

    #[test]
    fn test_parse_invoke_and_strings() {
        let implementation = parse_smali(
            r#"
            .registers 2
            const-string v0, "a, b # not a comment"
            invoke-static {v0, v1}, Lcom/example/Foo;->bar(Ljava/lang/String;I)V
            return-void
            "#,
        )
        .unwrap();
        let invoke = implementation.location_at(2).unwrap();
        let instruction = implementation.instruction(invoke).unwrap();
        assert_eq!(instruction.register_list(), &[0, 1]);
        let string = implementation.location_at(0).unwrap();
        assert_eq!(
            &**implementation.instruction(string).unwrap().reference().unwrap(),
            "a, b # not a comment"
        );
    }

    #[test]
    fn test_parse_catch() {
        let implementation = parse_smali(
            "
            .registers 1
            :try_start
            nop
            :try_end
            return-void
            :handler
            return-void
            .catch Ljava/lang/Exception; {:try_start .. :try_end} :handler
            .catchall {:try_start .. :try_end} :handler
            ",
        )
        .unwrap();
        let blocks = implementation.try_blocks();
        assert_eq!(blocks.len(), 2);
        assert_eq!(
            blocks[0].exception_type.as_deref(),
            Some("Ljava/lang/Exception;")
        );
        assert!(blocks[1].is_catch_all());
        assert_eq!(implementation.label_address(blocks[0].end), Some(1));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse_smali(".registers 1"), Err(Error::Empty)));
        assert!(parse_smali("nop").is_err());
        assert!(parse_smali(".registers 1\nfrobnicate v0").is_err());
        assert!(parse_smali(".registers 1\ngoto :nowhere").is_err());
        assert!(parse_smali(".registers 1\nconst/4 v0, 0x10").is_err());
        assert!(parse_smali(".registers 1\n:a\n:a\nreturn-void").is_err());

        match parse_smali(".registers 1\nnop\nbogus") {
            Err(Error::Malformed { message, .. }) => assert!(message.starts_with("line 3:")),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_literals() {
        assert_eq!(parse_literal("0x10").unwrap(), 16);
        assert_eq!(parse_literal("-0x1").unwrap(), -1);
        assert_eq!(parse_literal("42").unwrap(), 42);
        assert!(parse_literal("0xzz").is_err());
    }
}
