use crate::prelude::*;

// The requirement grammar:
//
//   req       := [platform ':'] name [extras] [constraint_list]
//   platform  := word '-' word '-' word | 'any'
//   extras    := '[' ident (',' ident)* ']'
//   constraint_list := constraint (',' constraint)*
//   constraint := ('=='|'!='|'<='|'>='|'<'|'>') version
//
// Whitespace around tokens is insignificant. The parser only splits the
// input apart; canonicalization (and its failures) happen in
// `VersionConstraint::new` / `Requirement::build`, so that a conflicting
// constraint list is not misreported as a syntax error.

pub struct ParsedRequirement {
    pub platform: Option<Platform>,
    pub name: PackageName,
    pub extras: Vec<String>,
    pub constraints: Vec<Constraint>,
}

peg::parser! {
    grammar parser() for str {
        rule wsp()
            = quiet!{ [' ' | '\t'] }

        rule _()
            = quiet!{ wsp()* }

        rule letter_or_digit()
            = quiet!{['A'..='Z' | 'a'..='z' | '0'..='9']} / expected!("letter or digit")

        rule version_cmp() -> &'input str
            = $("<=" / "<" / "!=" / "==" / ">=" / ">")

        rule version() -> &'input str
            = $((letter_or_digit() / "-" / "_" / "." )+)

        rule constraint_one() -> Constraint
            = _ op:version_cmp() _ v:version()
            {?
                let op: CompareOp = op.try_into().or(Err("comparison operator"))?;
                let version: Version = v.try_into().or(Err("version"))?;
                Ok(Constraint::new(op, version))
            }

        pub rule constraint_list() -> Vec<Constraint>
            = constraint_one() ++ (_ ",")

        rule identifier() -> &'input str
            = $(letter_or_digit() (letter_or_digit() / "-" / "_" / ".")*)

        rule name() -> PackageName
            = n:identifier() {? n.try_into().or(Err("package name")) }

        rule extra() -> String
            = _ e:identifier() _ { e.to_owned() }

        rule extras() -> Vec<String>
            = "[" es:(extra() ++ ",") "]" { es }

        rule platform_word()
            = (letter_or_digit() / "." / "_")+

        rule platform() -> Platform
            = p:$(platform_word() "-" platform_word() "-" platform_word() / "any")
              {? p.try_into().or(Err("platform")) }

        pub rule requirement() -> ParsedRequirement
            = _ platform:(p:platform() _ ":" _ { p })?
              name:name()
              _ extras:(extras() / "" { Vec::new() })
              _ constraints:(constraint_list() / "" { Vec::new() })
              _
              { ParsedRequirement { platform, name, extras, constraints } }
    }
}

pub fn requirement(input: &str) -> Result<ParsedRequirement> {
    match parser::requirement(input) {
        Ok(parsed) => Ok(parsed),
        Err(e) => Err(eyre!("at {}: expected {}", e.location, e.expected)).wrap_err(
            IpkgError::InvalidInput {
                what: "requirement",
                input: input.into(),
            },
        ),
    }
}

pub fn constraint_list(input: &str) -> Result<Vec<Constraint>> {
    match parser::constraint_list(input) {
        Ok(parsed) => Ok(parsed),
        Err(e) => Err(eyre!("at {}: expected {}", e.location, e.expected)).wrap_err(
            IpkgError::InvalidInput {
                what: "constraint list",
                input: input.into(),
            },
        ),
    }
}
