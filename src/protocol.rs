use std::mem;

/// Upper bound on a single decoded element, counted in code points. Anything
/// larger is a malformed or hostile stream.
pub const MAX_ELEMENT_LENGTH: usize = 1024 * 1024;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("element length prefix is not a decimal number")]
    BadLengthPrefix,
    #[error("element length exceeds {MAX_ELEMENT_LENGTH} characters")]
    ElementTooLong,
    #[error("expected ',' or ';' after element, found {0:?}")]
    BadSeparator(char),
    #[error("instruction stream is not valid utf-8")]
    InvalidUtf8,
}

/// One Guacamole instruction: an opcode followed by zero or more arguments.
///
/// The wire form is length-prefixed elements separated by commas and closed
/// by a semicolon, with lengths counted in Unicode code points:
/// `5.mouse,1.0,3.100,3.200;`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    elements: Vec<String>,
}

impl Instruction {
    pub fn new<S, I, A>(opcode: S, args: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        let mut elements = vec![opcode.into()];
        elements.extend(args.into_iter().map(Into::into));
        Self { elements }
    }

    /// Reassemble an instruction from decoded elements. Decoding always
    /// produces at least one element (the opcode, possibly empty).
    fn from_elements(elements: Vec<String>) -> Self {
        debug_assert!(!elements.is_empty());
        Self { elements }
    }

    pub fn opcode(&self) -> &str {
        &self.elements[0]
    }

    pub fn args(&self) -> &[String] {
        &self.elements[1..]
    }

    pub fn arg(&self, index: usize) -> Option<&str> {
        self.elements.get(index + 1).map(String::as_str)
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        for (index, element) in self.elements.iter().enumerate() {
            if index > 0 {
                out.push(',');
            }
            out.push_str(&element.chars().count().to_string());
            out.push('.');
            out.push_str(element);
        }
        out.push(';');
        out
    }
}

#[derive(Debug)]
enum DecodeState {
    /// Accumulating the decimal length prefix of the next element.
    Length { value: usize, any_digit: bool },
    /// Consuming exactly `remaining` more code points of element content.
    Element { remaining: usize },
    /// Expecting `,` (more elements) or `;` (instruction complete).
    Separator,
}

/// Incremental parser for a byte stream of encoded instructions.
///
/// Partial input is buffered, including length prefixes, element bodies and
/// UTF-8 sequences split across reads; results are identical for any
/// chunking of the same stream. Errors are terminal: once malformed, the
/// stream cannot be resynchronized and every later `feed` fails the same way.
#[derive(Debug)]
pub struct InstructionDecoder {
    buf: Vec<u8>,
    state: DecodeState,
    element: String,
    pending: Vec<String>,
    error: Option<ProtocolError>,
}

impl Default for InstructionDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl InstructionDecoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            state: DecodeState::Length {
                value: 0,
                any_digit: false,
            },
            element: String::new(),
            pending: Vec::new(),
            error: None,
        }
    }

    /// Consume a chunk of input and return every instruction it completes.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Instruction>, ProtocolError> {
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        let mut buf = mem::take(&mut self.buf);
        buf.extend_from_slice(bytes);

        // Parse the longest valid UTF-8 prefix; an incomplete trailing
        // sequence stays buffered, an invalid one poisons the stream.
        let (valid_len, invalid_sequence) = match std::str::from_utf8(&buf) {
            Ok(text) => (text.len(), false),
            Err(err) => (err.valid_up_to(), err.error_len().is_some()),
        };
        let text = std::str::from_utf8(&buf[..valid_len]).expect("validated prefix");

        let mut decoded = Vec::new();
        for ch in text.chars() {
            if let Err(error) = self.step(ch, &mut decoded) {
                self.error = Some(error.clone());
                return Err(error);
            }
        }

        if invalid_sequence {
            self.error = Some(ProtocolError::InvalidUtf8);
            return Err(ProtocolError::InvalidUtf8);
        }

        buf.drain(..valid_len);
        self.buf = buf;
        Ok(decoded)
    }

    fn step(&mut self, ch: char, decoded: &mut Vec<Instruction>) -> Result<(), ProtocolError> {
        match &mut self.state {
            DecodeState::Length { value, any_digit } => match ch {
                '0'..='9' => {
                    *value = *value * 10 + (ch as usize - '0' as usize);
                    *any_digit = true;
                    if *value > MAX_ELEMENT_LENGTH {
                        return Err(ProtocolError::ElementTooLong);
                    }
                }
                '.' if *any_digit => {
                    let length = *value;
                    if length == 0 {
                        self.pending.push(String::new());
                        self.state = DecodeState::Separator;
                    } else {
                        self.state = DecodeState::Element { remaining: length };
                    }
                }
                _ => return Err(ProtocolError::BadLengthPrefix),
            },
            DecodeState::Element { remaining } => {
                self.element.push(ch);
                *remaining -= 1;
                if *remaining == 0 {
                    self.pending.push(mem::take(&mut self.element));
                    self.state = DecodeState::Separator;
                }
            }
            DecodeState::Separator => {
                match ch {
                    ',' => {}
                    ';' => decoded.push(Instruction::from_elements(mem::take(&mut self.pending))),
                    other => return Err(ProtocolError::BadSeparator(other)),
                }
                self.state = DecodeState::Length {
                    value: 0,
                    any_digit: false,
                };
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &str) -> Vec<Instruction> {
        InstructionDecoder::new().feed(input.as_bytes()).unwrap()
    }

    #[test]
    fn encodes_the_reference_example() {
        let inst = Instruction::new("mouse", ["0", "100", "200"]);
        assert_eq!(inst.encode(), "5.mouse,1.0,3.100,3.200;");
    }

    #[test]
    fn lengths_count_code_points_not_bytes() {
        let inst = Instruction::new("name", ["Zürich", "🦀"]);
        assert_eq!(inst.encode(), "4.name,6.Zürich,1.🦀;");
        assert_eq!(decode_all("4.name,6.Zürich,1.🦀;"), vec![inst]);
    }

    #[test]
    fn decodes_what_it_encodes() {
        let instructions = vec![
            Instruction::new("select", ["rdp"]),
            Instruction::new("size", ["1024", "768", "96"]),
            Instruction::new("nop", Vec::<String>::new()),
            Instruction::new("blob", ["0", "with,comma.and;semicolon"]),
        ];
        let stream: String = instructions.iter().map(Instruction::encode).collect();
        assert_eq!(decode_all(&stream), instructions);
    }

    #[test]
    fn empty_opcode_is_legal() {
        let decoded = decode_all("0.;");
        assert_eq!(decoded, vec![Instruction::new("", Vec::<String>::new())]);
        assert_eq!(decoded[0].opcode(), "");
        assert!(decoded[0].args().is_empty());
    }

    #[test]
    fn buffers_partial_input_across_feeds() {
        let mut decoder = InstructionDecoder::new();
        assert!(decoder.feed(b"5.mou").unwrap().is_empty());
        assert!(decoder.feed(b"se,1.0").unwrap().is_empty());
        let decoded = decoder.feed(b";4.sync,1.7;").unwrap();
        assert_eq!(
            decoded,
            vec![
                Instruction::new("mouse", ["0"]),
                Instruction::new("sync", ["7"]),
            ]
        );
    }

    #[test]
    fn chunking_does_not_change_the_result() {
        let stream = "4.name,6.Zürich;3.key,3.100,1.1;0.;5.mouse,1.0;".as_bytes();
        let whole = InstructionDecoder::new().feed(stream).unwrap();

        for chunk_size in 1..stream.len() {
            let mut decoder = InstructionDecoder::new();
            let mut chunked = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                chunked.extend(decoder.feed(chunk).unwrap());
            }
            assert_eq!(chunked, whole, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn rejects_non_digit_length_prefix() {
        let mut decoder = InstructionDecoder::new();
        assert_eq!(
            decoder.feed(b"x.abc;"),
            Err(ProtocolError::BadLengthPrefix)
        );
    }

    #[test]
    fn rejects_missing_length_prefix() {
        let mut decoder = InstructionDecoder::new();
        assert_eq!(decoder.feed(b".abc;"), Err(ProtocolError::BadLengthPrefix));
    }

    #[test]
    fn rejects_bad_separator() {
        let mut decoder = InstructionDecoder::new();
        assert_eq!(
            decoder.feed(b"3.abc|"),
            Err(ProtocolError::BadSeparator('|'))
        );
    }

    #[test]
    fn rejects_oversized_elements() {
        let mut decoder = InstructionDecoder::new();
        let declared = format!("{}.", MAX_ELEMENT_LENGTH + 1);
        assert_eq!(
            decoder.feed(declared.as_bytes()),
            Err(ProtocolError::ElementTooLong)
        );
    }

    #[test]
    fn rejects_invalid_utf8() {
        let mut decoder = InstructionDecoder::new();
        assert_eq!(
            decoder.feed(&[b'3', b'.', 0xFF, 0xFE, 0xFD, b';']),
            Err(ProtocolError::InvalidUtf8)
        );
    }

    #[test]
    fn split_utf8_sequences_are_buffered() {
        let mut decoder = InstructionDecoder::new();
        let bytes = "1.é;".as_bytes();
        // Split in the middle of the two-byte é.
        assert!(decoder.feed(&bytes[..3]).unwrap().is_empty());
        assert_eq!(
            decoder.feed(&bytes[3..]).unwrap(),
            vec![Instruction::new("é", Vec::<String>::new())]
        );
    }

    #[test]
    fn errors_are_terminal() {
        let mut decoder = InstructionDecoder::new();
        assert!(decoder.feed(b"bogus").is_err());
        assert_eq!(decoder.feed(b"3.key;"), Err(ProtocolError::BadLengthPrefix));
    }
}
