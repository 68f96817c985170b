use crate::prelude::*;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

impl Display for CompareOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use CompareOp::*;
        write!(
            f,
            "{}",
            match self {
                Equal => "==",
                NotEqual => "!=",
                Less => "<",
                LessEqual => "<=",
                Greater => ">",
                GreaterEqual => ">=",
            }
        )
    }
}

impl TryFrom<&str> for CompareOp {
    type Error = eyre::Report;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        use CompareOp::*;
        Ok(match value {
            "==" => Equal,
            "!=" => NotEqual,
            "<" => Less,
            "<=" => LessEqual,
            ">" => Greater,
            ">=" => GreaterEqual,
            _ => {
                return Err(IpkgError::InvalidInput {
                    what: "comparison operator",
                    input: value.into(),
                }
                .into())
            }
        })
    }
}

try_from_str_boilerplate!(CompareOp);

/// A single `(comparator, version)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Constraint {
    pub op: CompareOp,
    pub version: Version,
}

impl Constraint {
    pub fn new(op: CompareOp, version: Version) -> Constraint {
        Constraint { op, version }
    }

    pub fn satisfied_by(&self, version: &Version) -> bool {
        use CompareOp::*;
        match self.op {
            Equal => version == &self.version,
            NotEqual => version != &self.version,
            Less => version < &self.version,
            LessEqual => version <= &self.version,
            Greater => version > &self.version,
            GreaterEqual => version >= &self.version,
        }
    }
}

impl Display for Constraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.op, self.version)
    }
}

/// A canonicalized list of constraints:
///
/// - all `==` pairs must agree, and collapse to one;
/// - multiple lower bounds collapse to the strictest, likewise upper bounds;
/// - `>=v, <=v` collapses to `==v`; impossible bound combinations fail;
/// - canonical order is `==`, upper bound, lower bound, then the `!=` set
///   ascending.
///
/// Construction is the only way in, so a value of this type is always in
/// canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct VersionConstraint {
    constraints: Vec<Constraint>,
}

fn conflict(left: &Constraint, right: &Constraint) -> eyre::Report {
    IpkgError::ConflictingConstraint {
        left: left.to_string(),
        right: right.to_string(),
    }
    .into()
}

impl VersionConstraint {
    pub fn any() -> VersionConstraint {
        VersionConstraint::default()
    }

    pub fn new(pairs: Vec<Constraint>) -> Result<VersionConstraint> {
        use CompareOp::*;

        let mut eq: Option<Constraint> = None;
        let mut lower: Option<Constraint> = None;
        let mut upper: Option<Constraint> = None;
        let mut neq: Vec<Constraint> = Vec::new();

        for pair in pairs {
            match pair.op {
                Equal => match &eq {
                    Some(prev) if prev.version != pair.version => {
                        return Err(conflict(prev, &pair))
                    }
                    Some(_) => (),
                    None => eq = Some(pair),
                },
                NotEqual => neq.push(pair),
                Greater | GreaterEqual => {
                    let stricter = match &lower {
                        None => true,
                        Some(prev) => {
                            pair.version > prev.version
                                || (pair.version == prev.version && pair.op == Greater)
                        }
                    };
                    if stricter {
                        lower = Some(pair);
                    }
                }
                Less | LessEqual => {
                    let stricter = match &upper {
                        None => true,
                        Some(prev) => {
                            pair.version < prev.version
                                || (pair.version == prev.version && pair.op == Less)
                        }
                    };
                    if stricter {
                        upper = Some(pair);
                    }
                }
            }
        }

        if let (Some(lo), Some(hi)) = (&lower, &upper) {
            if lo.version > hi.version {
                return Err(conflict(lo, hi));
            }
            if lo.version == hi.version {
                if lo.op == GreaterEqual && hi.op == LessEqual {
                    // >=v, <=v is just ==v
                    let collapsed = Constraint::new(Equal, lo.version.clone());
                    match &eq {
                        Some(prev) if prev.version != collapsed.version => {
                            return Err(conflict(prev, &collapsed))
                        }
                        _ => eq = Some(collapsed),
                    }
                    lower = None;
                    upper = None;
                } else {
                    return Err(conflict(lower.as_ref().unwrap(), upper.as_ref().unwrap()));
                }
            }
        }

        neq.sort_by(|a, b| a.version.cmp(&b.version));
        neq.dedup();

        let mut constraints = Vec::new();
        constraints.extend(eq);
        constraints.extend(upper);
        constraints.extend(lower);
        constraints.extend(neq);
        Ok(VersionConstraint { constraints })
    }

    pub fn merge(&self, other: &VersionConstraint) -> Result<VersionConstraint> {
        let mut pairs = self.constraints.clone();
        pairs.extend(other.constraints.iter().cloned());
        VersionConstraint::new(pairs)
    }

    pub fn satisfied_by(&self, version: &Version) -> bool {
        self.constraints.iter().all(|c| c.satisfied_by(version))
    }

    pub fn is_any(&self) -> bool {
        self.constraints.is_empty()
    }
}

impl Display for VersionConstraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for constraint in &self.constraints {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{}", constraint)?;
        }
        Ok(())
    }
}

impl TryFrom<&str> for VersionConstraint {
    type Error = eyre::Report;

    fn try_from(input: &str) -> Result<Self, Self::Error> {
        VersionConstraint::new(super::reqparse::constraint_list(input)?)
            .wrap_err_with(|| format!("in constraint list {:?}", input))
    }
}

try_from_str_boilerplate!(VersionConstraint);

#[cfg(test)]
mod test {
    use super::*;

    fn vc(s: &str) -> Result<VersionConstraint> {
        s.try_into()
    }

    #[test]
    fn test_lower_bounds_collapse() {
        assert_eq!(vc(">1,>2").unwrap().to_string(), ">2");
        assert_eq!(vc(">2,>1").unwrap().to_string(), ">2");
        assert_eq!(vc(">=1,>1").unwrap().to_string(), ">1");
        assert_eq!(vc(">=2,>1").unwrap().to_string(), ">=2");
        assert_eq!(vc(">1,>1").unwrap().to_string(), ">1");
    }

    #[test]
    fn test_upper_bounds_collapse() {
        assert_eq!(vc("<3,<2").unwrap().to_string(), "<2");
        assert_eq!(vc("<=3,<3").unwrap().to_string(), "<3");
        assert_eq!(vc("<=1,<2").unwrap().to_string(), "<=1");
        assert_eq!(vc("<=2,<1").unwrap().to_string(), "<1");
    }

    #[test]
    fn test_bounds_collapse_to_eq() {
        assert_eq!(vc(">=1,<=1").unwrap().to_string(), "==1");
    }

    #[test]
    fn test_impossible_bounds() {
        for bad in [">2,<1", ">1,<1", ">=1,<1", ">1,<=1", ">=2,<=1"] {
            assert!(vc(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn test_conflicting_eq() {
        let err = vc("==1,==2").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IpkgError>(),
            Some(IpkgError::ConflictingConstraint { .. })
        ));
        assert!(vc("==1,==1.0").is_ok());
    }

    #[test]
    fn test_canonical_order() {
        assert_eq!(vc(">1,!=3,<4,!=2").unwrap().to_string(), "<4,>1,!=2,!=3");
        assert_eq!(vc("!=2,!=2").unwrap().to_string(), "!=2");
    }

    #[test]
    fn test_satisfied_by() {
        let c = vc(">1,<2").unwrap();
        assert!(c.satisfied_by(&"1.5".try_into().unwrap()));
        assert!(!c.satisfied_by(&"1".try_into().unwrap()));
        assert!(!c.satisfied_by(&"2".try_into().unwrap()));

        let c = vc(">=1.0,!=1.5").unwrap();
        assert!(c.satisfied_by(&"1.4".try_into().unwrap()));
        assert!(!c.satisfied_by(&"1.5".try_into().unwrap()));

        assert!(VersionConstraint::any().satisfied_by(&"0.1".try_into().unwrap()));
    }

    #[test]
    fn test_merge() {
        let merged = vc(">1.1,>1").unwrap().merge(&vc("<3,<2").unwrap()).unwrap();
        assert_eq!(merged.to_string(), "<2,>1.1");
        assert!(merged.satisfied_by(&"1.5".try_into().unwrap()));
        assert!(!merged.satisfied_by(&"1".try_into().unwrap()));
        assert!(!merged.satisfied_by(&"2".try_into().unwrap()));

        assert!(vc(">2").unwrap().merge(&vc("<1").unwrap()).is_err());
    }
}
