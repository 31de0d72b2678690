use crate::prelude::*;

use super::marker::{Marker, Op, Value};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ParseExtra {
    Allowed,
    NotAllowed,
}

peg::parser! {
    grammar parser() for str {
        rule wsp()
            = quiet!{ [' ' | '\t' ] }

        rule letter_or_digit()
            = quiet!{['A'..='Z' | 'a'..='z' | '0'..='9']} / expected!("letter or digit")

        rule _()
            = quiet!{ wsp()* }

        // '===' has to come before '==' (and '~=' before '~'), because PEG
        // choice commits to the first alternative that matches and never
        // revisits it.
        rule version_cmp() -> &'input str
            = $("<=" / "<" / "!=" / "===" / "==" / ">=" / ">" / "~=" / "~" / "^")

        rule version()
            = (letter_or_digit() / "-" / "_" / "." / "*" / "+" / "!")+

        rule version_one() -> Specifier
            = _ op:version_cmp() _ v:$(version())
            {?
                Ok(Specifier {
                    op: op.try_into().or(Err("unrecognized version operator"))?,
                    value: v.into(),
                })
            }

        rule version_many() -> Specifiers
            = specs:(version_one() ++ (_ ",")) { Specifiers(specs) }

        pub rule versionspec() -> Specifiers
            = ("(" vm:version_many() ")" { vm }) / version_many()

        rule urlspec() -> Url
            = "@" _ u:$([^ ' ' | '\t' | ';']+)
              {? Url::parse(u).or(Err("invalid direct reference URL")) }

        rule not_in() -> &'static str
            = "not" wsp()+ "in" { "not in" }

        rule marker_op() -> &'input str
            = _ op:(version_cmp() / $("in") / not_in()) { op }

        rule python_str_c() -> &'input str
            = $(quiet! { [' ' | '\t' | 'A'..='Z' | 'a'..='z' | '0'..='9' | '(' | ')'
                 | '.' | '{' | '}' | '-' | '_' | '*' | '#' | ':' | ';' | ','
                 | '/' | '?' | '[' | ']' | '!' | '~' | '`' | '@' | '$' | '%'
                 | '^' | '&' | '=' | '+' | '|' | '<' | '>'] })
              / expected!("printable character")

        // PEP 508 says that we don't have to support backslash escapes, so we
        // don't, until some package in the wild turns out to use them.
        rule python_squote_str() -> &'input str
            = "'" s:$((python_str_c() / "\"")*) "'" { s }

        rule python_dquote_str() -> &'input str
            = "\"" s:$((python_str_c() / "'")*) "\"" { s }

        rule python_str() -> Value
            = s:(python_squote_str() / python_dquote_str())
              { Value::Literal(s.to_owned()) }

        rule env_var(parse_extra: ParseExtra) -> Value
            = var:$(
                "python_version" / "python_full_version" / "os_name"
                / "sys_platform" / "platform_release" / "platform_system"
                / "platform_version" / "platform_machine"
                / "platform_python_implementation" / "implementation_name"
                / "implementation_version" / "extra"
              )
              {?
               if ParseExtra::NotAllowed == parse_extra && var == "extra" {
                   return Err("'extra' marker is not valid in this context")
               }
               Ok(Value::Variable(var.to_owned()))
              }

        rule marker_var(parse_extra: ParseExtra) -> Value
            = _ v:(env_var(parse_extra) / python_str()) { v }

        rule marker_expr(parse_extra: ParseExtra) -> Marker
            = _ "(" m:marker(parse_extra) _ ")" { m }
              / lhs:marker_var(parse_extra) op:marker_op() rhs:marker_var(parse_extra)
              {?
                  let op = match op {
                      "in" => Op::In,
                      "not in" => Op::NotIn,
                      cmp => Op::Compare(
                          cmp.try_into().or(Err("unrecognized marker operator"))?,
                      ),
                  };
                  Ok(Marker::Atom { op, lhs, rhs })
              }

        rule marker_and(parse_extra: ParseExtra) -> Marker
            = lhs:marker_expr(parse_extra) _ "and" _ rhs:marker_and(parse_extra)
                 { Marker::And(Box::new(lhs), Box::new(rhs)) }
              / marker_expr(parse_extra)

        rule marker_or(parse_extra: ParseExtra) -> Marker
            = lhs:marker_and(parse_extra) _ "or" _ rhs:marker_or(parse_extra)
                 { Marker::Or(Box::new(lhs), Box::new(rhs)) }
              / marker_and(parse_extra)

        pub rule marker(parse_extra: ParseExtra) -> Marker
            = marker_or(parse_extra)

        rule quoted_marker(parse_extra: ParseExtra) -> Marker
            = ";" _ m:marker(parse_extra) { m }

        rule identifier() -> &'input str
            = $(letter_or_digit() (letter_or_digit() / "-" / "_" / ".")*)

        rule name() -> PackageName
            = n:identifier() {? n.try_into().or(Err("error parsing package name")) }

        rule extra() -> Extra
            = e:identifier() {? e.try_into().or(Err("error parsing extra name")) }

        rule extras() -> Vec<Extra>
            = "[" _ es:(extra() ** (_ "," _)) _ "]" { es }

        rule name_req(parse_extra: ParseExtra) -> Requirement
            = name:name()
              _ extras:(extras() / "" { Vec::new() })
              _ specifiers:(versionspec() / "" { Specifiers::any() })
              _ marker:(quoted_marker(parse_extra)?)
              {
                  Requirement {
                      name,
                      extras,
                      specifiers,
                      marker,
                      url: None,
                  }
              }

        rule url_req(parse_extra: ParseExtra) -> Requirement
            = name:name()
              _ extras:(extras() / "" { Vec::new() })
              _ url:urlspec()
              _ marker:((wsp() q:quoted_marker(parse_extra) { q })?)
            {
                Requirement {
                    name,
                    extras,
                    specifiers: Specifiers::any(),
                    marker,
                    url: Some(url),
                }
            }

        pub rule specification(parse_extra: ParseExtra) -> Requirement
            = _ r:( url_req(parse_extra) / name_req(parse_extra) ) _ { r }
    }
}

pub fn versionspec(input: &str) -> Result<Specifiers> {
    Ok(parser::versionspec(input)?)
}

pub fn specification(input: &str, parse_extra: ParseExtra) -> Result<Requirement> {
    Ok(parser::specification(input, parse_extra)?)
}

pub fn marker(input: &str, parse_extra: ParseExtra) -> Result<Marker> {
    Ok(parser::marker(input, parse_extra)?)
}
