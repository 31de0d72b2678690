use crate::prelude::*;

// Environment markers, per PEP 508. We keep the AST small -- atoms plus
// and/or -- and push all the interesting work into operations on it:
// concrete evaluation, the extra-projection used when expanding optional
// dependency sets, and the symbolic satisfiability check the resolver uses
// to decide whether an edge can be live in *any* environment the project
// supports.

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    Variable(String),
    Literal(String),
}

impl Value {
    pub fn is_extra(&self) -> bool {
        matches!(self, Value::Variable(name) if name == "extra")
    }

    fn eval(&self, env: &HashMap<String, String>) -> Result<String> {
        match self {
            Value::Variable(varname) => env
                .get(varname)
                .cloned()
                .ok_or_else(|| eyre!("no environment marker variable named '{}'", varname)),
            Value::Literal(s) => Ok(s.clone()),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Op {
    Compare(CompareOp),
    In,
    NotIn,
}

impl Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Op::Compare(op) => write!(f, "{}", op),
            Op::In => write!(f, "in"),
            Op::NotIn => write!(f, "not in"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Marker {
    And(Box<Marker>, Box<Marker>),
    Or(Box<Marker>, Box<Marker>),
    Atom { op: Op, lhs: Value, rhs: Value },
}

fn compare_strings(op: CompareOp, lhs: &str, rhs: &str) -> Result<bool> {
    // If both sides work as versions (or the RHS works as a wildcard with a
    // wildcard-accepting operator), we do a PEP 440 comparison; otherwise we
    // fall back to plain string comparison. This matches what the 'packaging'
    // module does.
    if let Ok(lhs_ver) = Version::try_from(lhs) {
        let spec = Specifier {
            op,
            value: rhs.into(),
        };
        if let Ok(lowered) = spec.to_spec() {
            return Ok(lowered.contains(&lhs_ver));
        }
    }
    use CompareOp::*;
    Ok(match op {
        LessThanEqual => lhs <= rhs,
        StrictlyLessThan => lhs < rhs,
        NotEqual => lhs != rhs,
        Equal => lhs == rhs,
        ArbitraryEqual => lhs == rhs,
        GreaterThanEqual => lhs >= rhs,
        StrictlyGreaterThan => lhs > rhs,
        Compatible | Caret | Tilde => {
            bail!("operator {} requires valid version strings", op)
        }
    })
}

impl Marker {
    pub fn atom(op: Op, lhs: Value, rhs: Value) -> Marker {
        Marker::Atom { op, lhs, rhs }
    }

    pub fn eval(&self, env: &HashMap<String, String>) -> Result<bool> {
        Ok(match self {
            Marker::And(lhs, rhs) => lhs.eval(env)? && rhs.eval(env)?,
            Marker::Or(lhs, rhs) => lhs.eval(env)? || rhs.eval(env)?,
            Marker::Atom { op, lhs, rhs } => {
                let lhs_val = lhs.eval(env)?;
                let rhs_val = rhs.eval(env)?;
                match op {
                    Op::In => rhs_val.contains(&lhs_val),
                    Op::NotIn => !rhs_val.contains(&lhs_val),
                    Op::Compare(op) => compare_strings(*op, &lhs_val, &rhs_val)?,
                }
            }
        })
    }

    /// Symbolic conjunction. None stands for the always-true marker.
    pub fn and(lhs: Option<&Marker>, rhs: Option<&Marker>) -> Option<Marker> {
        match (lhs, rhs) {
            (None, None) => None,
            (Some(m), None) | (None, Some(m)) => Some(m.clone()),
            (Some(a), Some(b)) => {
                if a == b {
                    Some(a.clone())
                } else {
                    Some(Marker::And(Box::new(a.clone()), Box::new(b.clone())))
                }
            }
        }
    }

    /// Symbolic disjunction. None (always-true) absorbs everything.
    pub fn or(lhs: Option<&Marker>, rhs: Option<&Marker>) -> Option<Marker> {
        match (lhs, rhs) {
            (None, _) | (_, None) => None,
            (Some(a), Some(b)) => {
                if a == b {
                    Some(a.clone())
                } else {
                    Some(Marker::Or(Box::new(a.clone()), Box::new(b.clone())))
                }
            }
        }
    }

    /// Disjunctive normal form: a union of clauses, each a conjunction of
    /// atoms. Exercised by tests to cross-check eval.
    pub fn to_dnf(&self) -> Vec<Vec<Marker>> {
        match self {
            Marker::Atom { .. } => vec![vec![self.clone()]],
            Marker::Or(lhs, rhs) => {
                let mut clauses = lhs.to_dnf();
                clauses.extend(rhs.to_dnf());
                clauses
            }
            Marker::And(lhs, rhs) => {
                let left = lhs.to_dnf();
                let right = rhs.to_dnf();
                let mut clauses = Vec::with_capacity(left.len() * right.len());
                for l in &left {
                    for r in &right {
                        let mut clause = l.clone();
                        clause.extend(r.iter().cloned());
                        clauses.push(clause);
                    }
                }
                clauses
            }
        }
    }

    pub fn eval_dnf(
        clauses: &[Vec<Marker>],
        env: &HashMap<String, String>,
    ) -> Result<bool> {
        for clause in clauses {
            let mut all = true;
            for atom in clause {
                if !atom.eval(env)? {
                    all = false;
                    break;
                }
            }
            if all {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl Marker {
    /// Evaluate against a concrete environment plus a *set* of requested
    /// extras: `extra == "x"` atoms test membership. This is what install
    /// planning uses against locked markers, where several extras can be
    /// active at once.
    pub fn eval_with_extras(
        &self,
        env: &HashMap<String, String>,
        active: &HashSet<Extra>,
    ) -> Result<bool> {
        match self {
            Marker::And(lhs, rhs) => {
                Ok(lhs.eval_with_extras(env, active)? && rhs.eval_with_extras(env, active)?)
            }
            Marker::Or(lhs, rhs) => {
                Ok(lhs.eval_with_extras(env, active)? || rhs.eval_with_extras(env, active)?)
            }
            Marker::Atom { op, lhs, rhs } => {
                if lhs.is_extra() || rhs.is_extra() {
                    let literal = match (lhs, rhs) {
                        (Value::Literal(s), other) | (other, Value::Literal(s))
                            if other.is_extra() =>
                        {
                            s
                        }
                        _ => bail!("anomalous 'extra' expression: {}", self),
                    };
                    let wanted: Extra = literal.as_str().parse()?;
                    return match op {
                        Op::Compare(CompareOp::Equal) => Ok(active.contains(&wanted)),
                        Op::Compare(CompareOp::NotEqual) => Ok(!active.contains(&wanted)),
                        _ => bail!("anomalous 'extra' expression: {}", self),
                    };
                }
                self.eval(env)
            }
        }
    }
}

/// The result of partially evaluating a marker: either it collapsed to a
/// constant, or some residue remains.
pub enum Simplified {
    True,
    False,
    Expr(Marker),
}

impl Simplified {
    pub fn into_marker(self) -> Option<Marker> {
        match self {
            Simplified::True => None,
            Simplified::False => {
                // callers that care about unsatisfiable residues check first
                None
            }
            Simplified::Expr(m) => Some(m),
        }
    }

    pub fn is_false(&self) -> bool {
        matches!(self, Simplified::False)
    }
}

impl Display for Simplified {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Simplified::True => write!(f, "true"),
            Simplified::False => write!(f, "false"),
            Simplified::Expr(e) => write!(f, "{}", e),
        }
    }
}

impl Marker {
    /// Substitute a concrete activation for the `extra` variable and fold
    /// away everything that becomes constant. `extra = None` means no extra
    /// is active, so `extra == "anything"` turns false.
    pub fn without_extra(&self, extra: Option<&Extra>) -> Result<Simplified> {
        Ok(match self {
            Marker::And(lhs, rhs) => {
                let lhs = lhs.without_extra(extra)?;
                let rhs = rhs.without_extra(extra)?;
                match (lhs, rhs) {
                    (Simplified::True, Simplified::True) => Simplified::True,
                    (_, Simplified::False) | (Simplified::False, _) => Simplified::False,
                    (Simplified::Expr(l), Simplified::True) => Simplified::Expr(l),
                    (Simplified::True, Simplified::Expr(r)) => Simplified::Expr(r),
                    (Simplified::Expr(l), Simplified::Expr(r)) => {
                        Simplified::Expr(Marker::And(Box::new(l), Box::new(r)))
                    }
                }
            }
            Marker::Or(lhs, rhs) => {
                let lhs = lhs.without_extra(extra)?;
                let rhs = rhs.without_extra(extra)?;
                match (lhs, rhs) {
                    (Simplified::False, Simplified::False) => Simplified::False,
                    (_, Simplified::True) | (Simplified::True, _) => Simplified::True,
                    (Simplified::Expr(l), Simplified::False) => Simplified::Expr(l),
                    (Simplified::False, Simplified::Expr(r)) => Simplified::Expr(r),
                    (Simplified::Expr(l), Simplified::Expr(r)) => {
                        Simplified::Expr(Marker::Or(Box::new(l), Box::new(r)))
                    }
                }
            }
            Marker::Atom { op, lhs, rhs } => {
                if !lhs.is_extra() && !rhs.is_extra() {
                    return Ok(Simplified::Expr(self.clone()));
                }
                // the non-extra side must be a literal naming an extra;
                // anything else ('extra == extra', 'extra == os_name') we
                // refuse to reason about
                let literal = match (lhs, rhs) {
                    (Value::Literal(s), other) | (other, Value::Literal(s))
                        if other.is_extra() =>
                    {
                        s
                    }
                    _ => bail!("anomalous 'extra' expression: {}", self),
                };
                // extras compare by canonical form on both sides
                let wanted: Option<Extra> = literal.as_str().try_into().ok();
                let holds = match op {
                    Op::Compare(CompareOp::Equal) => match (&wanted, extra) {
                        (Some(w), Some(e)) => w.canonical() == e.canonical(),
                        _ => false,
                    },
                    Op::Compare(CompareOp::NotEqual) => match (&wanted, extra) {
                        (Some(w), Some(e)) => w.canonical() != e.canonical(),
                        _ => true,
                    },
                    _ => bail!("anomalous 'extra' expression: {}", self),
                };
                if holds {
                    Simplified::True
                } else {
                    Simplified::False
                }
            }
        })
    }
}

/// What the resolver knows about "all the environments this project
/// supports": a python-version range, any platform. Markers over python
/// versions get checked against the range; everything else is treated as
/// possibly-true.
pub struct MarkerUniverse {
    python_full_versions: VersionSpec,
}

impl MarkerUniverse {
    pub fn new(python_full_versions: VersionSpec) -> MarkerUniverse {
        MarkerUniverse {
            python_full_versions,
        }
    }

    /// Could this marker evaluate true in some supported environment? This is
    /// a sound over-approximation: atoms we can't reason about count as
    /// satisfiable, and And doesn't track correlations between atoms.
    pub fn may_hold(&self, marker: &Marker) -> bool {
        match marker {
            Marker::And(lhs, rhs) => self.may_hold(lhs) && self.may_hold(rhs),
            Marker::Or(lhs, rhs) => self.may_hold(lhs) || self.may_hold(rhs),
            Marker::Atom { op, lhs, rhs } => self.atom_may_hold(*op, lhs, rhs),
        }
    }

    fn atom_may_hold(&self, op: Op, lhs: &Value, rhs: &Value) -> bool {
        let compare_op = match op {
            Op::Compare(c) => c,
            // substring tests against python versions aren't worth modelling
            Op::In | Op::NotIn => return true,
        };
        let (var, literal, flipped) = match (lhs, rhs) {
            (Value::Variable(var), Value::Literal(lit)) => (var, lit, false),
            (Value::Literal(lit), Value::Variable(var)) => (var, lit, true),
            // literal-vs-literal folds to a constant; variable-vs-variable we
            // don't model
            (Value::Literal(a), Value::Literal(b)) => {
                return compare_strings(compare_op, a, b).unwrap_or(true);
            }
            (Value::Variable(_), Value::Variable(_)) => return true,
        };
        if var != "python_version" && var != "python_full_version" {
            return true;
        }
        // put the variable on the left: "3.9" > python_version is
        // python_version < "3.9"
        use CompareOp::*;
        let op = if flipped {
            match compare_op {
                LessThanEqual => GreaterThanEqual,
                StrictlyLessThan => StrictlyGreaterThan,
                GreaterThanEqual => LessThanEqual,
                StrictlyGreaterThan => StrictlyLessThan,
                other => other,
            }
        } else {
            compare_op
        };
        let clause = Specifier {
            op,
            value: literal.clone(),
        };
        match clause.to_spec() {
            Ok(lowered) => !lowered.intersect(&self.python_full_versions).is_empty(),
            // unparseable literal: can't prove it never holds
            Err(_) => true,
        }
    }
}

impl Display for Marker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn fmt_value(value: &Value, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match value {
                Value::Variable(name) => write!(f, "{}", name),
                Value::Literal(s) => write!(f, "\"{}\"", s),
            }
        }
        // 'or' children of an 'and' need parens; everything else doesn't
        fn fmt_inner(
            marker: &Marker,
            parent_is_and: bool,
            f: &mut std::fmt::Formatter<'_>,
        ) -> std::fmt::Result {
            match marker {
                Marker::Atom { op, lhs, rhs } => {
                    fmt_value(lhs, f)?;
                    write!(f, " {} ", op)?;
                    fmt_value(rhs, f)
                }
                Marker::And(lhs, rhs) => {
                    fmt_inner(lhs, true, f)?;
                    write!(f, " and ")?;
                    fmt_inner(rhs, true, f)
                }
                Marker::Or(lhs, rhs) => {
                    if parent_is_and {
                        write!(f, "(")?;
                    }
                    fmt_inner(lhs, false, f)?;
                    write!(f, " or ")?;
                    fmt_inner(rhs, false, f)?;
                    if parent_is_and {
                        write!(f, ")")?;
                    }
                    Ok(())
                }
            }
        }
        fmt_inner(self, false, f)
    }
}
