use crate::prelude::*;

// METADATA / PKG-INFO files claim to be RFC 822 messages. They are not; the
// real format is "whatever Python's email.parser accepts". We parse the
// subset that actually occurs in the wild: header lines (with continuation
// lines kept verbatim, embedded newlines and all), a blank line, and then an
// optional free-form body that modern files use for the description.
//
// Unlike email.parser we reject a few genuinely-broken shapes (empty field
// names, a continuation line before any field) instead of guessing.

#[cfg_attr(test, derive(Debug, PartialEq, Deserialize))]
pub struct HeaderBlock {
    pub fields: HashMap<String, Vec<String>>,
    pub body: Option<String>,
}

peg::parser! {
    grammar header_parser() for str {
        rule eol()
            = quiet!{"\r\n" / "\r" / "\n"} / expected!("end of line")

        // every printable ascii char except ':'
        rule field_name() -> &'input str
            = quiet!{$(['\x21'..='\x39' | '\x3b'..='\x7e']+)}
              / expected!("field name")

        // email.parser eats ' ' and '\t' right after the colon but keeps any
        // further whitespace
        rule sep()
            = ":" [' ' | '\t']*

        rule value_line()
            = [^ '\r' | '\n']*

        rule continuation()
            = quiet!{eol() [' ' | '\t']} / expected!("continuation line")

        rule field_value() -> &'input str
            = $(value_line() ** continuation())

        rule field() -> (String, String)
            = n:field_name() sep() v:field_value() { (n.to_owned(), v.to_owned()) }

        rule body() -> String
            = eol() eol() b:$([_]*) { b.to_owned() }

        // the final eol()? mops up a single trailing newline when there's no
        // body (if there is a body, it has already consumed everything)
        pub rule block() -> HeaderBlock
            = f:(field() ** eol()) body:(body()?) eol()?
                 {
                     let mut fields: HashMap<String, Vec<String>> = HashMap::new();
                     for (name, value) in f {
                         fields.entry(name).or_default().push(value);
                     }
                     HeaderBlock { fields, body }
                 }
    }
}

impl HeaderBlock {
    pub fn parse(input: &str) -> Result<HeaderBlock> {
        Ok(header_parser::block(input)?)
    }

    /// Remove and return every value of a repeatable field.
    pub fn take_all(&mut self, key: &str) -> Vec<String> {
        self.fields.remove(key).unwrap_or_default()
    }

    /// Remove a field that may appear at most once.
    pub fn take_optional(&mut self, key: &str) -> Result<Option<String>> {
        let mut values = self.take_all(key);
        match values.len() {
            0 => Ok(None),
            1 => Ok(values.pop()),
            n => bail!("field {} appears {} times, expected at most once", key, n),
        }
    }

    /// Remove a field that must appear exactly once.
    pub fn take_required(&mut self, key: &str) -> Result<String> {
        self.take_optional(key)?
            .ok_or_else(|| eyre!("missing required field {}", key))
    }
}
