// src/expr/parser.rs
//! Lexer and recursive-descent parser for alarm expressions.
//!
//! Whitespace is stripped before parsing, so every node can record the
//! exact slice of the stripped input it was parsed from. That slice is the
//! node's canonical string; the root's canonical string always equals the
//! whitespace-stripped input, and leaf canonical strings key per-leaf state
//! inside threshold processor buckets.

use crate::error::{Result, VigilError};
use crate::types::SubAlarmDescriptor;
use std::collections::HashMap;

/// Non-structural characters permitted in metric and dimension identifiers,
/// besides ASCII alphanumerics and non-space BMP code points above 0x7F.
const IDENT_PUNCT: &str = ".-_#!$%&'*+/:;?@[\\]^`|~";

/// Longest identifier accepted for metric names, dimension names and
/// dimension values.
const MAX_IDENT_LEN: usize = 255;

/// Aggregation function of a sub-expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Sum,
    Avg,
    Max,
    Min,
    Count,
}

impl AggFunc {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sum" => Some(AggFunc::Sum),
            "avg" => Some(AggFunc::Avg),
            "max" => Some(AggFunc::Max),
            "min" => Some(AggFunc::Min),
            "count" => Some(AggFunc::Count),
            _ => None,
        }
    }

    /// Normalized (upper-cased) name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AggFunc::Sum => "SUM",
            AggFunc::Avg => "AVG",
            AggFunc::Max => "MAX",
            AggFunc::Min => "MIN",
            AggFunc::Count => "COUNT",
        }
    }
}

/// Relational operator of a sub-expression, normalized from either the
/// symbolic (`<`, `<=`, `>`, `>=`) or the spelled (`lt`, `lte`, `gt`,
/// `gte`) form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Lte,
    Gt,
    Gte,
}

impl CompareOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Lt => "LT",
            CompareOp::Lte => "LTE",
            CompareOp::Gt => "GT",
            CompareOp::Gte => "GTE",
        }
    }

    /// Whether `value` satisfies the operator against `threshold`.
    pub fn satisfied_by(&self, value: f64, threshold: f64) -> bool {
        match self {
            CompareOp::Lt => value < threshold,
            CompareOp::Lte => value <= threshold,
            CompareOp::Gt => value > threshold,
            CompareOp::Gte => value >= threshold,
        }
    }
}

/// Boolean connective. `and`/`&&` bind tighter than `or`/`||`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicOp {
    And,
    Or,
}

/// One aggregate-threshold clause.
#[derive(Debug, Clone, PartialEq)]
pub struct SubExpr {
    pub func: AggFunc,
    /// Lower-cased for matching.
    pub metric_name: String,
    /// Dimension constraints as written; matching is case-insensitive.
    pub dimensions: HashMap<String, String>,
    pub op: CompareOp,
    pub threshold: f64,
    /// Window width in seconds. Defaults to 60.
    pub period: u64,
    /// Number of consecutive windows considered. Defaults to 1.
    pub periods: u32,
    /// The exact whitespace-stripped source slice of this clause.
    pub canonical: String,
}

impl SubExpr {
    /// The `expression_data` document shape for this clause.
    pub fn descriptor(&self) -> SubAlarmDescriptor {
        SubAlarmDescriptor {
            function: self.func.as_str().to_string(),
            metric_name: self.metric_name.clone(),
            dimensions: self.dimensions.clone(),
            operator: self.op.as_str().to_string(),
            threshold: self.threshold,
            period: self.period,
            periods: self.periods,
        }
    }
}

/// Parsed boolean tree. Always a tree, never a DAG; connectives are n-ary
/// (`a and b and c` is one `BinOp` with three operands).
#[derive(Debug, Clone, PartialEq)]
pub enum ExprNode {
    Leaf(SubExpr),
    BinOp {
        op: LogicOp,
        operands: Vec<ExprNode>,
        canonical: String,
    },
}

impl ExprNode {
    pub fn canonical(&self) -> &str {
        match self {
            ExprNode::Leaf(sub) => &sub.canonical,
            ExprNode::BinOp { canonical, .. } => canonical,
        }
    }

    fn set_canonical(&mut self, canonical: String) {
        match self {
            ExprNode::Leaf(sub) => sub.canonical = canonical,
            ExprNode::BinOp { canonical: c, .. } => *c = canonical,
        }
    }

    /// All sub-expressions in source order.
    pub fn leaves(&self) -> Vec<&SubExpr> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a SubExpr>) {
        match self {
            ExprNode::Leaf(sub) => out.push(sub),
            ExprNode::BinOp { operands, .. } => {
                for operand in operands {
                    operand.collect_leaves(out);
                }
            }
        }
    }
}

/// Parse an alarm expression into its boolean tree.
pub fn parse(expression: &str) -> Result<ExprNode> {
    let stripped: Vec<char> = expression.chars().filter(|c| !c.is_whitespace()).collect();
    if stripped.is_empty() {
        return Err(VigilError::Expression("empty expression".to_string()));
    }
    let mut parser = Parser {
        chars: stripped,
        pos: 0,
    };
    let node = parser.parse_or()?;
    if parser.pos != parser.chars.len() {
        return Err(VigilError::Expression(format!(
            "unexpected input at offset {}",
            parser.pos
        )));
    }
    Ok(node)
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn slice(&self, start: usize, end: usize) -> String {
        self.chars[start..end].iter().collect()
    }

    fn err(&self, what: &str) -> VigilError {
        VigilError::Expression(format!("{} at offset {}", what, self.pos))
    }

    /// Case-insensitive literal lookahead.
    fn looking_at(&self, lit: &str) -> bool {
        lit.chars().enumerate().all(|(i, l)| {
            self.chars
                .get(self.pos + i)
                .map(|c| c.eq_ignore_ascii_case(&l))
                .unwrap_or(false)
        })
    }

    fn eat(&mut self, lit: &str) -> bool {
        if self.looking_at(lit) {
            self.pos += lit.chars().count();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<()> {
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.err(&format!("expected '{}'", c)))
        }
    }

    fn is_ident_char(c: char) -> bool {
        c.is_ascii_alphanumeric()
            || IDENT_PUNCT.contains(c)
            || ((c as u32) > 0x7F && (c as u32) <= 0xFFFF && !c.is_whitespace())
    }

    fn read_ident(&mut self) -> Result<String> {
        let start = self.pos;
        while self.peek().map(Self::is_ident_char).unwrap_or(false) {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.err("expected identifier"));
        }
        if self.pos - start > MAX_IDENT_LEN {
            return Err(self.err("identifier longer than 255 characters"));
        }
        Ok(self.slice(start, self.pos))
    }

    fn read_integer<T: std::str::FromStr>(&mut self) -> Result<T> {
        let start = self.pos;
        while self.peek().map(|c| c.is_ascii_digit()).unwrap_or(false) {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.err("expected integer"));
        }
        self.slice(start, self.pos)
            .parse::<T>()
            .map_err(|_| self.err("integer out of range"))
    }

    fn read_decimal(&mut self) -> Result<f64> {
        let start = self.pos;
        while self
            .peek()
            .map(|c| c.is_ascii_digit() || c == '.')
            .unwrap_or(false)
        {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.err("expected number"));
        }
        self.slice(start, self.pos)
            .parse::<f64>()
            .map_err(|_| self.err("malformed number"))
    }

    fn parse_or(&mut self) -> Result<ExprNode> {
        let start = self.pos;
        let first = self.parse_and()?;
        let mut operands = vec![first];
        loop {
            if self.eat("||") || self.eat("or") {
                operands.push(self.parse_and()?);
            } else {
                break;
            }
        }
        if operands.len() == 1 {
            Ok(operands.pop().unwrap())
        } else {
            Ok(ExprNode::BinOp {
                op: LogicOp::Or,
                operands,
                canonical: self.slice(start, self.pos),
            })
        }
    }

    fn parse_and(&mut self) -> Result<ExprNode> {
        let start = self.pos;
        let first = self.parse_atom()?;
        let mut operands = vec![first];
        loop {
            // Do not let the and-level consume the or-connective.
            if self.looking_at("or") || self.looking_at("||") {
                break;
            }
            if self.eat("&&") || self.eat("and") {
                operands.push(self.parse_atom()?);
            } else {
                break;
            }
        }
        if operands.len() == 1 {
            Ok(operands.pop().unwrap())
        } else {
            Ok(ExprNode::BinOp {
                op: LogicOp::And,
                operands,
                canonical: self.slice(start, self.pos),
            })
        }
    }

    fn parse_atom(&mut self) -> Result<ExprNode> {
        if self.peek() == Some('(') {
            let start = self.pos;
            self.pos += 1;
            let mut node = self.parse_or()?;
            self.expect(')')?;
            // Widen the span to cover the parentheses so the root's
            // canonical string always equals the stripped input.
            node.set_canonical(self.slice(start, self.pos));
            Ok(node)
        } else {
            self.parse_sub().map(ExprNode::Leaf)
        }
    }

    fn parse_sub(&mut self) -> Result<SubExpr> {
        let start = self.pos;

        let func_name = self.read_ident()?;
        let func = AggFunc::parse(&func_name)
            .ok_or_else(|| self.err(&format!("unknown function '{}'", func_name)))?;

        self.expect('(')?;
        let metric_name = self.read_ident()?.to_lowercase();

        let mut dimensions = HashMap::new();
        if self.peek() == Some('{') {
            self.pos += 1;
            loop {
                let key = self.read_ident()?;
                self.expect('=')?;
                let value = self.read_ident()?;
                dimensions.insert(key, value);
                if self.peek() == Some(',') {
                    self.pos += 1;
                } else {
                    break;
                }
            }
            self.expect('}')?;
        }

        let period = if self.peek() == Some(',') {
            self.pos += 1;
            self.read_integer::<u64>()?
        } else {
            60
        };
        self.expect(')')?;

        let op = self.read_relop()?;
        let threshold = self.read_decimal()?;

        let periods = if self.looking_at("times")
            && self
                .chars
                .get(self.pos + 5)
                .map(|c| c.is_ascii_digit())
                .unwrap_or(false)
        {
            self.pos += 5;
            self.read_integer::<u32>()?
        } else {
            1
        };
        if periods == 0 {
            return Err(self.err("periods must be positive"));
        }

        Ok(SubExpr {
            func,
            metric_name,
            dimensions,
            op,
            threshold,
            period,
            periods,
            canonical: self.slice(start, self.pos),
        })
    }

    fn read_relop(&mut self) -> Result<CompareOp> {
        // Longer spellings first so `<=` is not read as `<`.
        for (lit, op) in [
            ("<=", CompareOp::Lte),
            (">=", CompareOp::Gte),
            ("<", CompareOp::Lt),
            (">", CompareOp::Gt),
            ("lte", CompareOp::Lte),
            ("gte", CompareOp::Gte),
            ("lt", CompareOp::Lt),
            ("gt", CompareOp::Gt),
        ] {
            if self.eat(lit) {
                return Ok(op);
            }
        }
        Err(self.err("expected relational operator"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strip(s: &str) -> String {
        s.chars().filter(|c| !c.is_whitespace()).collect()
    }

    #[test]
    fn simple_sub_expression() {
        let node = parse("max(foo)>10").unwrap();
        let leaves = node.leaves();
        assert_eq!(leaves.len(), 1);
        let sub = leaves[0];
        assert_eq!(sub.func, AggFunc::Max);
        assert_eq!(sub.metric_name, "foo");
        assert!(sub.dimensions.is_empty());
        assert_eq!(sub.op, CompareOp::Gt);
        assert_eq!(sub.threshold, 10.0);
        assert_eq!(sub.period, 60);
        assert_eq!(sub.periods, 1);
        assert_eq!(sub.canonical, "max(foo)>10");
    }

    #[test]
    fn full_tree_shape() {
        let expr = "max(cpu{host=h1},60)>10 times 3 and (min(mem)<5 or count(err)>0)";
        let node = parse(expr).unwrap();
        assert_eq!(node.canonical(), strip(expr));

        let ExprNode::BinOp { op, operands, .. } = &node else {
            panic!("expected a connective at the root");
        };
        assert_eq!(*op, LogicOp::And);
        assert_eq!(operands.len(), 2);

        let ExprNode::Leaf(left) = &operands[0] else {
            panic!("expected a leaf on the left");
        };
        assert_eq!(left.func, AggFunc::Max);
        assert_eq!(left.metric_name, "cpu");
        assert_eq!(left.dimensions.get("host").unwrap(), "h1");
        assert_eq!(left.op, CompareOp::Gt);
        assert_eq!(left.threshold, 10.0);
        assert_eq!(left.period, 60);
        assert_eq!(left.periods, 3);

        let ExprNode::BinOp { op, operands, .. } = &operands[1] else {
            panic!("expected a connective on the right");
        };
        assert_eq!(*op, LogicOp::Or);
        assert_eq!(operands.len(), 2);
    }

    #[test]
    fn operator_normalization() {
        for (spelled, op) in [
            ("lt", CompareOp::Lt),
            ("LTE", CompareOp::Lte),
            ("gt", CompareOp::Gt),
            ("GtE", CompareOp::Gte),
            ("<", CompareOp::Lt),
            ("<=", CompareOp::Lte),
            (">", CompareOp::Gt),
            (">=", CompareOp::Gte),
        ] {
            let node = parse(&format!("avg(m) {} 1.5", spelled)).unwrap();
            assert_eq!(node.leaves()[0].op, op, "operator {}", spelled);
        }
    }

    #[test]
    fn connective_spellings_and_precedence() {
        // and binds tighter than or
        let node = parse("max(a)>1 or max(b)>1 && max(c)>1").unwrap();
        let ExprNode::BinOp { op, operands, .. } = &node else {
            panic!("expected or at root");
        };
        assert_eq!(*op, LogicOp::Or);
        assert!(matches!(operands[0], ExprNode::Leaf(_)));
        assert!(matches!(
            &operands[1],
            ExprNode::BinOp {
                op: LogicOp::And,
                ..
            }
        ));
    }

    #[test]
    fn nary_connectives_flatten() {
        let node = parse("max(a)>1 and max(b)>1 and max(c)>1").unwrap();
        let ExprNode::BinOp { operands, .. } = &node else {
            panic!()
        };
        assert_eq!(operands.len(), 3);
    }

    #[test]
    fn function_and_metric_normalization() {
        let node = parse("MAX(FoO{Host=H1})>1").unwrap();
        let sub = node.leaves()[0];
        assert_eq!(sub.func.as_str(), "MAX");
        assert_eq!(sub.metric_name, "foo");
        // dimension case is preserved; matching is case-insensitive later
        assert_eq!(sub.dimensions.get("Host").unwrap(), "H1");
    }

    #[test]
    fn unicode_identifiers() {
        let expr = "max(-_.千幸福的笑脸{घोड़ा=馬,dn2=dv2}) gte 100 times 3";
        let node = parse(expr).unwrap();
        let sub = node.leaves()[0];
        assert_eq!(sub.metric_name, "-_.千幸福的笑脸");
        assert_eq!(sub.dimensions.get("घोड़ा").unwrap(), "馬");
        assert_eq!(sub.op, CompareOp::Gte);
        assert_eq!(sub.periods, 3);
        assert_eq!(node.canonical(), strip(expr));
    }

    #[test]
    fn rejects_malformed_expressions() {
        for bad in [
            "",
            "   ",
            "max(foo)",
            "max(foo>10",
            "max(foo))>10",
            "median(foo)>10",
            "max(foo)>",
            "max(foo)>abc",
            "max(foo{host})>1",
            "max(foo)>1 and",
            "max(foo)>1 junk",
            "(max(foo)>1",
        ] {
            assert!(parse(bad).is_err(), "should reject {:?}", bad);
        }
    }

    #[test]
    fn rejects_overlong_identifier() {
        let long = "x".repeat(256);
        assert!(parse(&format!("max({})>1", long)).is_err());
        let ok = "x".repeat(255);
        assert!(parse(&format!("max({})>1", ok)).is_ok());
    }

    #[test]
    fn zero_periods_is_invalid() {
        assert!(parse("max(foo)>1 times 0").is_err());
    }

    #[test]
    fn parenthesized_root_keeps_full_canonical() {
        let node = parse("( max(a)>1 or max(b)>2 )").unwrap();
        assert_eq!(node.canonical(), "(max(a)>1ormax(b)>2)");
    }

    #[test]
    fn descriptor_shape() {
        let node = parse("count(log.errors{service=api}, 120) >= 5 times 2").unwrap();
        let d = node.leaves()[0].descriptor();
        assert_eq!(d.function, "COUNT");
        assert_eq!(d.metric_name, "log.errors");
        assert_eq!(d.operator, "GTE");
        assert_eq!(d.threshold, 5.0);
        assert_eq!(d.period, 120);
        assert_eq!(d.periods, 2);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn ident() -> impl Strategy<Value = String> {
            "[a-z][a-z0-9._-]{0,12}"
        }

        fn sub_expr() -> impl Strategy<Value = String> {
            (
                prop::sample::select(vec!["max", "min", "avg", "sum", "count"]),
                ident(),
                prop::collection::vec((ident(), ident()), 0..3),
                prop::sample::select(vec!["<", "<=", ">", ">=", "lt", "lte", "gt", "gte"]),
                0u32..100000,
                prop::option::of(1u64..3600),
                prop::option::of(1u32..10),
            )
                .prop_map(|(f, m, dims, op, t, period, periods)| {
                    let mut s = format!("{}({}", f, m);
                    if !dims.is_empty() {
                        let pairs: Vec<String> =
                            dims.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                        s.push('{');
                        s.push_str(&pairs.join(","));
                        s.push('}');
                    }
                    if let Some(p) = period {
                        s.push_str(&format!(",{}", p));
                    }
                    s.push(')');
                    s.push_str(&format!(" {} {}", op, t));
                    if let Some(p) = periods {
                        s.push_str(&format!(" times {}", p));
                    }
                    s
                })
        }

        fn expression() -> impl Strategy<Value = (String, usize)> {
            (
                sub_expr(),
                prop::collection::vec(
                    (
                        prop::sample::select(vec!["and", "&&", "or", "||"]),
                        sub_expr(),
                    ),
                    0..4,
                ),
            )
                .prop_map(|(first, rest)| {
                    let count = rest.len() + 1;
                    let mut s = first;
                    for (conn, sub) in rest {
                        s.push_str(&format!(" {} {}", conn, sub));
                    }
                    (s, count)
                })
        }

        proptest! {
            #[test]
            fn canonical_string_round_trips((expr, _) in expression()) {
                let node = parse(&expr).unwrap();
                let stripped: String = expr.chars().filter(|c| !c.is_whitespace()).collect();
                prop_assert_eq!(node.canonical(), stripped.as_str());
            }

            #[test]
            fn every_clause_becomes_a_leaf((expr, clauses) in expression()) {
                let node = parse(&expr).unwrap();
                prop_assert_eq!(node.leaves().len(), clauses);
            }
        }
    }
}
