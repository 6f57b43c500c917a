use std::{fmt::Display, sync::LazyLock};

use auto_ops::*;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{data::EventTable, TauFitError, TauFitResult};

static DOUBLE_OPERATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:&&|\|\|) *(?:&&|\|\|)").unwrap());
static OPPOSITE_SIGN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"q_[12]\s*\*\s*q_[12]\s*<\s*0").unwrap());
static SAME_SIGN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"q_[12]\s*\*\s*q_[12]\s*>\s*0").unwrap());
static SHIFT_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(Up|Down)").unwrap());
static SHIFT_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_[a-zA-Z]+(Up|Down|nom)").unwrap());

/// A cut or weight expression evaluated on event rows.
///
/// The text is kept verbatim so that it round-trips into histogram names and output records, but
/// composition goes through [`join_cuts`] and [`join_weights`] (or the `&` and `*` operators)
/// rather than string concatenation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Expression(String);

impl Expression {
    /// Wrap a string, trimming surrounding whitespace.
    pub fn new<S: AsRef<str>>(text: S) -> Self {
        Self(text.as_ref().trim().to_string())
    }
    /// The empty expression (no cut, unit weight).
    pub fn empty() -> Self {
        Self::default()
    }
    /// A constant weight.
    pub fn constant(value: f64) -> Self {
        Self(format!("{value}"))
    }
    /// Returns `true` if this expression does nothing (no cut / unit weight).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    /// The underlying text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
    /// Returns `true` if the text contains `pattern`.
    pub fn contains(&self, pattern: &str) -> bool {
        self.0.contains(pattern)
    }
    /// Substitute every occurrence of `old` by `new`.
    pub fn replace(&self, old: &str, new: &str) -> Self {
        Self::new(self.0.replace(old, new))
    }
    /// Parse the expression into a [`CompiledExpr`].
    pub fn compile(&self) -> TauFitResult<CompiledExpr> {
        CompiledExpr::compile(&self.0)
    }
}

impl Display for Expression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Expression {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Expression {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&String> for Expression {
    fn from(value: &String) -> Self {
        Self::new(value)
    }
}

impl AsRef<str> for Expression {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl_op_ex!(&|a: &Expression, b: &Expression| -> Expression { join_cuts([a, b]) });
impl_op_ex!(*|a: &Expression, b: &Expression| -> Expression { join_weights([a, b]) });

fn has_operator_outside_parens(text: &str) -> bool {
    let mut depth = 0usize;
    for c in text.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            '=' | '<' | '>' | '+' | '-' | '&' | '|' if depth == 0 => return true,
            _ => {}
        }
    }
    false
}

/// Join cut expressions with `&&`, dropping empty ones.
///
/// A part containing a bare `||` without any parentheses is wrapped in parentheses before joining.
pub fn join_cuts<'a, I>(cuts: I) -> Expression
where
    I: IntoIterator<Item = &'a Expression>,
{
    let parts: Vec<String> = cuts
        .into_iter()
        .filter(|cut| !cut.is_empty())
        .map(|cut| {
            if cut.contains("||") && !(cut.contains("(") && cut.contains(")")) {
                log::warn!("joincuts: Be careful with \"or\" statements in '{}'!", cut);
                format!("({})", cut)
            } else {
                cut.as_str().to_string()
            }
        })
        .collect();
    Expression::new(parts.join(" && "))
}

/// Join weight expressions multiplicatively, dropping empty ones.
pub fn join_weights<'a, I>(weights: I) -> Expression
where
    I: IntoIterator<Item = &'a Expression>,
{
    let parts: Vec<&str> = weights
        .into_iter()
        .filter(|weight| !weight.is_empty())
        .map(Expression::as_str)
        .collect();
    Expression::new(parts.join("*").replace("*/", "/"))
}

/// Join cuts and fold a weight into the result as `(cuts)*weight`.
///
/// The weight is parenthesised when it carries operators outside parentheses. Without cuts the
/// weight alone is returned.
pub fn join_cuts_weighted<'a, I>(cuts: I, weight: &Expression) -> Expression
where
    I: IntoIterator<Item = &'a Expression>,
{
    let cuts = join_cuts(cuts);
    let weight = if !weight.is_empty() && has_operator_outside_parens(weight.as_str()) {
        Expression::new(format!("({})", weight))
    } else {
        weight.clone()
    };
    match (cuts.is_empty(), weight.is_empty()) {
        (true, _) => weight,
        (false, true) => cuts,
        (false, false) => Expression::new(format!("({})*{}", cuts, weight)),
    }
}

/// Clean up doubled or dangling boolean operators left behind by substitutions.
pub fn clean_bool(text: &str) -> String {
    DOUBLE_OPERATOR
        .replace_all(text, "&&")
        .trim_matches(' ')
        .trim_matches('&')
        .trim_matches(' ')
        .to_string()
}

/// Target of a charge-sign substitution.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargeTarget {
    /// Opposite-sign pair, `q_1*q_2<0`.
    OS,
    /// Same-sign pair, `q_1*q_2>0`.
    SS,
    /// Drop the charge requirement.
    Remove,
}

impl Display for ChargeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChargeTarget::OS => write!(f, "OS"),
            ChargeTarget::SS => write!(f, "SS"),
            ChargeTarget::Remove => write!(f, ""),
        }
    }
}

impl std::str::FromStr for ChargeTarget {
    type Err = TauFitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "os" | "opposite" => Ok(Self::OS),
            "ss" | "same" => Ok(Self::SS),
            "" | "none" | "remove" => Ok(Self::Remove),
            _ => Err(TauFitError::ParseError {
                name: s.to_string(),
                object: "ChargeTarget".to_string(),
            }),
        }
    }
}

/// Find the pair-charge requirement in `cuts` and invert it to `target` (or remove it).
pub fn invert_charge(cuts: &Expression, target: ChargeTarget) -> Expression {
    if cuts.is_empty() {
        return match target {
            ChargeTarget::OS => Expression::new("q_1*q_2<0"),
            ChargeTarget::SS => Expression::new("q_1*q_2>0"),
            ChargeTarget::Remove => Expression::empty(),
        };
    }
    let (os, ss) = (&*OPPOSITE_SIGN, &*SAME_SIGN);
    let n_matches = os.find_iter(cuts.as_str()).count() + ss.find_iter(cuts.as_str()).count();
    if n_matches > 1 {
        log::warn!(
            "invertcharge: more than one charge match ({}) in '{}'",
            n_matches,
            cuts
        );
    }
    let text = match target {
        ChargeTarget::OS => ss.replace_all(cuts.as_str(), "q_1*q_2<0").to_string(),
        ChargeTarget::SS => os.replace_all(cuts.as_str(), "q_1*q_2>0").to_string(),
        ChargeTarget::Remove => {
            let text = os.replace_all(cuts.as_str(), "");
            ss.replace_all(&text, "").to_string()
        }
    };
    Expression::new(clean_bool(&text))
}

const JET_SHIFT_PATTERNS: [(&str, Option<&str>); 7] = [
    (r"jpt_[12]", None),
    (r"jeta_[12]", None),
    (r"jets\w*", None),
    (r"nc?btag\w*", None),
    (r"mt_1", None),
    (r"met", Some("filter")),
    (r"dphi_ll_bj", None),
];
const UNCLUSTERED_SHIFT_PATTERNS: [(&str, Option<&str>); 2] = [(r"mt_1", None), (r"met", Some("filter"))];

/// Append a jet-energy shift tag (e.g. `_jecUp`) to every jet-dependent variable in `expression`.
///
/// Unclustered-energy shifts only touch `mt_1` and `met`.
pub fn shift_jet_vars(expression: &Expression, shift: &str) -> Expression {
    let patterns: &[(&str, Option<&str>)] = if shift.to_lowercase().contains("unclusten") {
        &UNCLUSTERED_SHIFT_PATTERNS
    } else {
        &JET_SHIFT_PATTERNS
    };
    if SHIFT_TAG.is_match(expression.as_str())
    {
        log::warn!("shiftjetvars: Already shifts in '{}'", expression);
    }
    let tag = if shift.is_empty() || shift.starts_with('_') {
        shift.to_string()
    } else {
        format!("_{shift}")
    };
    let mut text = expression.as_str().to_string();
    for (pattern, veto) in patterns {
        let Ok(re) = Regex::new(pattern) else {
            continue;
        };
        let mut shifted = String::with_capacity(text.len() + tag.len());
        let mut last = 0;
        for found in re.find_iter(&text) {
            shifted.push_str(&text[last..found.end()]);
            let vetoed = veto.is_some_and(|veto| text[found.end()..].starts_with(veto));
            if !vetoed {
                shifted.push_str(&tag);
            }
            last = found.end();
        }
        shifted.push_str(&text[last..]);
        text = shifted;
    }
    Expression::new(text)
}

/// Append a shift tag to every occurrence of the given variable patterns.
pub fn shift_vars<S: AsRef<str>>(expression: &Expression, shift: &str, patterns: &[S]) -> Expression {
    let tag = if shift.is_empty() || shift.starts_with('_') {
        shift.to_string()
    } else {
        format!("_{shift}")
    };
    let mut text = expression.as_str().to_string();
    for pattern in patterns {
        match Regex::new(&format!("({})", pattern.as_ref())) {
            Ok(re) => text = re.replace_all(&text, format!("${{1}}{tag}")).into_owned(),
            Err(err) => log::warn!("shift_vars: skipping pattern '{}': {err}", pattern.as_ref()),
        }
    }
    Expression::new(text)
}

/// Strip systematic shift tags (`_xxxUp`, `_xxxDown`, `_xxxnom`) from a name.
pub fn undo_shift(text: &str) -> String {
    SHIFT_SUFFIX.replace_all(text, "")
        .to_string()
}

#[derive(Debug, Clone)]
enum Node {
    Number(f64),
    Var(usize),
    Neg(Box<Node>),
    Not(Box<Node>),
    BinOp(BinOp, Box<Node>, Box<Node>),
    Ternary(Box<Node>, Box<Node>, Box<Node>),
    Call(Func, Vec<Node>),
}

#[derive(Debug, Clone, Copy)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy)]
enum Func {
    Abs,
    Sqrt,
    Log,
    Log10,
    Exp,
    Pow,
    Min,
    Max,
    Cos,
    Sin,
    Tan,
    Atan2,
    Floor,
    Ceil,
}

impl Func {
    fn from_name(name: &str) -> Option<(Self, usize)> {
        Some(match name {
            "abs" | "fabs" | "TMath::Abs" => (Self::Abs, 1),
            "sqrt" | "TMath::Sqrt" => (Self::Sqrt, 1),
            "log" | "TMath::Log" => (Self::Log, 1),
            "log10" | "TMath::Log10" => (Self::Log10, 1),
            "exp" | "TMath::Exp" => (Self::Exp, 1),
            "pow" | "TMath::Power" => (Self::Pow, 2),
            "min" | "TMath::Min" => (Self::Min, 2),
            "max" | "TMath::Max" => (Self::Max, 2),
            "cos" | "TMath::Cos" => (Self::Cos, 1),
            "sin" | "TMath::Sin" => (Self::Sin, 1),
            "tan" | "TMath::Tan" => (Self::Tan, 1),
            "atan2" | "TMath::ATan2" => (Self::Atan2, 2),
            "floor" | "TMath::Floor" => (Self::Floor, 1),
            "ceil" | "TMath::Ceil" => (Self::Ceil, 1),
            _ => return None,
        })
    }
}

#[inline]
fn truth(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

impl BinOp {
    #[inline]
    fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            BinOp::Add => lhs + rhs,
            BinOp::Sub => lhs - rhs,
            BinOp::Mul => lhs * rhs,
            BinOp::Div => lhs / rhs,
            BinOp::Mod => lhs % rhs,
            BinOp::Eq => truth((lhs - rhs).abs() < f64::EPSILON),
            BinOp::Ne => truth((lhs - rhs).abs() >= f64::EPSILON),
            BinOp::Lt => truth(lhs < rhs),
            BinOp::Le => truth(lhs <= rhs),
            BinOp::Gt => truth(lhs > rhs),
            BinOp::Ge => truth(lhs >= rhs),
            BinOp::And => truth(lhs != 0.0 && rhs != 0.0),
            BinOp::Or => truth(lhs != 0.0 || rhs != 0.0),
        }
    }
}

impl Func {
    #[inline]
    fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            Func::Abs => a.abs(),
            Func::Sqrt => a.sqrt(),
            Func::Log => a.ln(),
            Func::Log10 => a.log10(),
            Func::Exp => a.exp(),
            Func::Pow => a.powf(b),
            Func::Min => a.min(b),
            Func::Max => a.max(b),
            Func::Cos => a.cos(),
            Func::Sin => a.sin(),
            Func::Tan => a.tan(),
            Func::Atan2 => a.atan2(b),
            Func::Floor => a.floor(),
            Func::Ceil => a.ceil(),
        }
    }
}

/// A compiled expression ready for column-wise evaluation.
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    node: Node,
    /// Column names referenced by the expression, in order of first appearance.
    pub required_columns: Vec<String>,
}

impl CompiledExpr {
    /// Parse and compile an expression string. An empty string compiles to the constant `1`.
    pub fn compile(input: &str) -> TauFitResult<Self> {
        if input.trim().is_empty() {
            return Ok(Self {
                node: Node::Number(1.0),
                required_columns: Vec::new(),
            });
        }
        let tokens = tokenize(input)?;
        let mut parser = Parser::new(input, &tokens);
        let node = parser.parse_ternary()?;
        if parser.pos < tokens.len() {
            return Err(parser.error(format!(
                "unexpected token after expression: {:?}",
                tokens[parser.pos]
            )));
        }
        Ok(Self {
            node,
            required_columns: parser.columns,
        })
    }

    /// Returns `true` if the expression does not depend on any column.
    pub fn is_constant(&self) -> bool {
        self.required_columns.is_empty()
    }

    /// Evaluate the expression for a single row; `values` follow [`CompiledExpr::required_columns`].
    pub fn eval_row(&self, values: &[f64]) -> f64 {
        eval_row(&self.node, values)
    }

    /// Evaluate the expression over every row of `table`.
    pub fn evaluate(&self, table: &EventTable) -> TauFitResult<Vec<f64>> {
        let columns = self
            .required_columns
            .iter()
            .map(|name| {
                table
                    .column(name)
                    .map(|column| column.as_slice())
                    .ok_or_else(|| TauFitError::MissingColumn { name: name.clone() })
            })
            .collect::<TauFitResult<Vec<&[f64]>>>()?;
        Ok(eval_columns(&self.node, &columns, table.n_rows()))
    }
}

fn eval_row(node: &Node, values: &[f64]) -> f64 {
    match node {
        Node::Number(n) => *n,
        Node::Var(i) => values[*i],
        Node::Neg(a) => -eval_row(a, values),
        Node::Not(a) => truth(eval_row(a, values) == 0.0),
        Node::BinOp(op, a, b) => op.apply(eval_row(a, values), eval_row(b, values)),
        Node::Ternary(c, a, b) => {
            if eval_row(c, values) != 0.0 {
                eval_row(a, values)
            } else {
                eval_row(b, values)
            }
        }
        Node::Call(f, args) => {
            let a = eval_row(&args[0], values);
            let b = args.get(1).map_or(0.0, |arg| eval_row(arg, values));
            f.apply(a, b)
        }
    }
}

fn eval_columns(node: &Node, columns: &[&[f64]], n_rows: usize) -> Vec<f64> {
    match node {
        Node::Number(n) => vec![*n; n_rows],
        Node::Var(i) => columns[*i].to_vec(),
        Node::Neg(a) => eval_columns(a, columns, n_rows)
            .into_iter()
            .map(|x| -x)
            .collect(),
        Node::Not(a) => eval_columns(a, columns, n_rows)
            .into_iter()
            .map(|x| truth(x == 0.0))
            .collect(),
        Node::BinOp(op, a, b) => {
            let lhs = eval_columns(a, columns, n_rows);
            let rhs = eval_columns(b, columns, n_rows);
            lhs.into_iter()
                .zip(rhs)
                .map(|(l, r)| op.apply(l, r))
                .collect()
        }
        Node::Ternary(c, a, b) => {
            let cond = eval_columns(c, columns, n_rows);
            let yes = eval_columns(a, columns, n_rows);
            let no = eval_columns(b, columns, n_rows);
            cond.into_iter()
                .zip(yes.into_iter().zip(no))
                .map(|(c, (y, n))| if c != 0.0 { y } else { n })
                .collect()
        }
        Node::Call(f, args) => {
            let a = eval_columns(&args[0], columns, n_rows);
            match args.get(1) {
                Some(arg) => a
                    .into_iter()
                    .zip(eval_columns(arg, columns, n_rows))
                    .map(|(a, b)| f.apply(a, b))
                    .collect(),
                None => a.into_iter().map(|a| f.apply(a, 0.0)).collect(),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
    Comma,
    Question,
    Colon,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
}

fn tokenize(input: &str) -> TauFitResult<Vec<Token>> {
    let invalid = |reason: String| TauFitError::ExpressionError {
        expression: input.to_string(),
        reason,
    };
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if i + 1 < bytes.len() {
            let tok = match &bytes[i..i + 2] {
                b"&&" => Some(Token::And),
                b"||" => Some(Token::Or),
                b"==" => Some(Token::Eq),
                b"!=" => Some(Token::Ne),
                b"<=" => Some(Token::Le),
                b">=" => Some(Token::Ge),
                _ => None,
            };
            if let Some(tok) = tok {
                tokens.push(tok);
                i += 2;
                continue;
            }
        }
        let single = match c {
            '+' => Some(Token::Plus),
            '-' => Some(Token::Minus),
            '*' => Some(Token::Star),
            '/' => Some(Token::Slash),
            '%' => Some(Token::Percent),
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            ',' => Some(Token::Comma),
            '?' => Some(Token::Question),
            '<' => Some(Token::Lt),
            '>' => Some(Token::Gt),
            '!' => Some(Token::Not),
            _ => None,
        };
        if let Some(tok) = single {
            tokens.push(tok);
            i += 1;
            continue;
        }
        if c == ':' {
            // `TMath::Abs` style namespaces are glued to the identifier below
            tokens.push(Token::Colon);
            i += 1;
            continue;
        }
        if c.is_ascii_digit() || c == '.' {
            let start = i;
            while i < bytes.len() {
                let d = bytes[i] as char;
                let exponent_sign =
                    (d == '+' || d == '-') && i > start && matches!(bytes[i - 1], b'e' | b'E');
                if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' || exponent_sign {
                    i += 1;
                } else {
                    break;
                }
            }
            let text = &input[start..i];
            let value: f64 = text
                .parse()
                .map_err(|_| invalid(format!("invalid number '{text}'")))?;
            tokens.push(Token::Num(value));
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            loop {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                if i + 2 < bytes.len()
                    && &bytes[i..i + 2] == b"::"
                    && (bytes[i + 2].is_ascii_alphabetic() || bytes[i + 2] == b'_')
                {
                    i += 2;
                    continue;
                }
                break;
            }
            tokens.push(Token::Ident(input[start..i].to_string()));
            continue;
        }
        return Err(invalid(format!("unexpected character '{c}'")));
    }
    Ok(tokens)
}

struct Parser<'a> {
    input: &'a str,
    tokens: &'a [Token],
    pos: usize,
    columns: Vec<String>,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str, tokens: &'a [Token]) -> Self {
        Self {
            input,
            tokens,
            pos: 0,
            columns: Vec::new(),
        }
    }

    fn error(&self, reason: String) -> TauFitError {
        TauFitError::ExpressionError {
            expression: self.input.to_string(),
            reason,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: &Token) -> TauFitResult<()> {
        match self.advance() {
            Some(token) if token == expected => Ok(()),
            other => {
                let found = format!("{:?}", other);
                Err(self.error(format!("expected {:?}, got {}", expected, found)))
            }
        }
    }

    fn resolve_column(&mut self, name: &str) -> usize {
        if let Some(i) = self.columns.iter().position(|column| column == name) {
            i
        } else {
            self.columns.push(name.to_string());
            self.columns.len() - 1
        }
    }

    fn parse_ternary(&mut self) -> TauFitResult<Node> {
        let condition = self.parse_or()?;
        if matches!(self.peek(), Some(Token::Question)) {
            self.advance();
            let yes = self.parse_ternary()?;
            self.expect(&Token::Colon)?;
            let no = self.parse_ternary()?;
            return Ok(Node::Ternary(
                Box::new(condition),
                Box::new(yes),
                Box::new(no),
            ));
        }
        Ok(condition)
    }

    fn parse_or(&mut self) -> TauFitResult<Node> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Node::BinOp(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> TauFitResult<Node> {
        let mut lhs = self.parse_cmp()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.advance();
            let rhs = self.parse_cmp()?;
            lhs = Node::BinOp(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_cmp(&mut self) -> TauFitResult<Node> {
        let mut lhs = self.parse_add()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinOp::Eq,
                Some(Token::Ne) => BinOp::Ne,
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_add()?;
            lhs = Node::BinOp(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_add(&mut self) -> TauFitResult<Node> {
        let mut lhs = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_mul()?;
            lhs = Node::BinOp(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_mul(&mut self) -> TauFitResult<Node> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Mod,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Node::BinOp(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_unary(&mut self) -> TauFitResult<Node> {
        match self.peek() {
            Some(Token::Minus) => {
                self.advance();
                Ok(Node::Neg(Box::new(self.parse_unary()?)))
            }
            Some(Token::Plus) => {
                self.advance();
                self.parse_unary()
            }
            Some(Token::Not) => {
                self.advance();
                Ok(Node::Not(Box::new(self.parse_unary()?)))
            }
            _ => self.parse_atom(),
        }
    }

    fn parse_atom(&mut self) -> TauFitResult<Node> {
        match self.advance().cloned() {
            Some(Token::Num(value)) => Ok(Node::Number(value)),
            Some(Token::LParen) => {
                let node = self.parse_ternary()?;
                self.expect(&Token::RParen)?;
                Ok(node)
            }
            Some(Token::Ident(name)) => {
                if matches!(self.peek(), Some(Token::LParen)) {
                    self.advance();
                    let (func, arity) = Func::from_name(&name)
                        .ok_or_else(|| self.error(format!("unknown function '{name}'")))?;
                    let mut args = vec![self.parse_ternary()?];
                    while matches!(self.peek(), Some(Token::Comma)) {
                        self.advance();
                        args.push(self.parse_ternary()?);
                    }
                    self.expect(&Token::RParen)?;
                    if args.len() != arity {
                        return Err(self.error(format!(
                            "function '{name}' takes {arity} argument(s), got {}",
                            args.len()
                        )));
                    }
                    Ok(Node::Call(func, args))
                } else {
                    match name.as_str() {
                        "true" | "True" | "kTRUE" => Ok(Node::Number(1.0)),
                        "false" | "False" | "kFALSE" => Ok(Node::Number(0.0)),
                        _ => Ok(Node::Var(self.resolve_column(&name))),
                    }
                }
            }
            other => Err(self.error(format!(
                "expected number, identifier, or '(', got {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_join_cuts_drops_empty_and_wraps_or() {
        let cuts = [
            Expression::new("pt_1>20"),
            Expression::empty(),
            Expression::new("dm_2==0 || dm_2==1"),
        ];
        assert_eq!(
            join_cuts(&cuts).as_str(),
            "pt_1>20 && (dm_2==0 || dm_2==1)"
        );
        assert!(join_cuts(&[Expression::empty()]).is_empty());
    }

    #[test]
    fn test_join_weights() {
        let weights = [
            Expression::new("genweight"),
            Expression::empty(),
            Expression::new("/idisoweight_1"),
        ];
        assert_eq!(join_weights(&weights).as_str(), "genweight/idisoweight_1");
        let product = Expression::new("a") * Expression::new("b");
        assert_eq!(product.as_str(), "a*b");
        let cut = Expression::new("q_1*q_2<0") & Expression::new("iso_1<0.15");
        assert_eq!(cut.as_str(), "q_1*q_2<0 && iso_1<0.15");
    }

    #[test]
    fn test_join_cuts_weighted() {
        let cuts = [Expression::new("pt_1>20")];
        assert_eq!(
            join_cuts_weighted(&cuts, &Expression::new("genweight")).as_str(),
            "(pt_1>20)*genweight"
        );
        assert_eq!(
            join_cuts_weighted(&cuts, &Expression::new("a+b")).as_str(),
            "(pt_1>20)*(a+b)"
        );
        assert_eq!(
            join_cuts_weighted(&[], &Expression::new("w")).as_str(),
            "w"
        );
    }

    #[test]
    fn test_invert_charge() {
        let cuts = Expression::new("q_1*q_2<0 && iso_1<0.15");
        assert_eq!(
            invert_charge(&cuts, ChargeTarget::SS).as_str(),
            "q_1*q_2>0 && iso_1<0.15"
        );
        assert_eq!(
            invert_charge(&cuts, ChargeTarget::Remove).as_str(),
            "iso_1<0.15"
        );
        assert_eq!(
            invert_charge(&Expression::empty(), ChargeTarget::OS).as_str(),
            "q_1*q_2<0"
        );
    }

    #[test]
    fn test_remove_charge_in_the_middle() {
        let cuts = Expression::new("pt_1>20 && q_1*q_2<0 && iso_1<0.15");
        assert_eq!(
            invert_charge(&cuts, ChargeTarget::Remove).as_str(),
            "pt_1>20 && iso_1<0.15"
        );
        assert_eq!(
            invert_charge(&invert_charge(&cuts, ChargeTarget::SS), ChargeTarget::OS),
            cuts
        );
        assert_eq!(clean_bool("&& a>1 && || b<2"), "a>1 && b<2");
    }

    #[test]
    fn test_shift_jet_vars() {
        let expr = Expression::new("njets>0 && met>50 && metfilter");
        assert_eq!(
            shift_jet_vars(&expr, "jecUp").as_str(),
            "njets_jecUp>0 && met_jecUp>50 && metfilter"
        );
        assert_eq!(undo_shift("njets_jecUp"), "njets");
    }

    #[test]
    fn test_compile_and_evaluate_rows() {
        let e = CompiledExpr::compile("njet >= 4 && pt_lead > 25.0").unwrap();
        assert_eq!(e.required_columns, vec!["njet", "pt_lead"]);
        assert_relative_eq!(e.eval_row(&[4.0, 30.0]), 1.0);
        assert_relative_eq!(e.eval_row(&[3.0, 30.0]), 0.0);
        let e = CompiledExpr::compile("(q_1*q_2>0)?1:-1").unwrap();
        assert_relative_eq!(e.eval_row(&[1.0, 1.0]), 1.0);
        assert_relative_eq!(e.eval_row(&[1.0, -1.0]), -1.0);
        let e = CompiledExpr::compile("min(m_vis, 199.9) + TMath::Abs(-1)").unwrap();
        assert_relative_eq!(e.eval_row(&[250.0]), 200.9);
        let e = CompiledExpr::compile("1.5e2 + 3.0E-1 + 7 % 4").unwrap();
        assert!(e.is_constant());
        assert_relative_eq!(e.eval_row(&[]), 153.3);
    }

    #[test]
    fn test_nested_ternary_is_right_associative() {
        let e = CompiledExpr::compile("x>2 ? 2 : x>1 ? 1 : 0").unwrap();
        assert_relative_eq!(e.eval_row(&[3.0]), 2.0);
        assert_relative_eq!(e.eval_row(&[1.5]), 1.0);
        assert_relative_eq!(e.eval_row(&[0.5]), 0.0);
    }

    #[test]
    fn test_evaluate_table() {
        let table = EventTable::from_columns([
            ("a".to_string(), vec![1.0, 2.0, 3.0]),
            ("b".to_string(), vec![10.0, 20.0, 30.0]),
        ])
        .unwrap();
        let e = Expression::new("a + b").compile().unwrap();
        assert_eq!(e.evaluate(&table).unwrap(), vec![11.0, 22.0, 33.0]);
        let unit = Expression::empty().compile().unwrap();
        assert_eq!(unit.evaluate(&table).unwrap(), vec![1.0; 3]);
        let missing = Expression::new("c").compile().unwrap();
        assert!(matches!(
            missing.evaluate(&table),
            Err(TauFitError::MissingColumn { .. })
        ));
    }

    #[test]
    fn test_parse_errors() {
        assert!(CompiledExpr::compile("a +").is_err());
        assert!(CompiledExpr::compile("foo(1)").is_err());
        assert!(CompiledExpr::compile("pow(1)").is_err());
        assert!(CompiledExpr::compile("a $ b").is_err());
    }
}
