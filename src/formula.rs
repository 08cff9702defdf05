//! Custom-formula sublanguage for composite tests: element names are
//! substituted by their raw scores, then the remaining text must pass a
//! strict character whitelist before a small recursive-descent evaluator
//! runs it. Arbitrary code never reaches an interpreter.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum FormulaError {
    #[error("formula contains characters outside the arithmetic whitelist")]
    DisallowedCharacters,
    #[error("unexpected token at position {0}")]
    UnexpectedToken(usize),
    #[error("unexpected end of formula")]
    UnexpectedEnd,
    #[error("division by zero")]
    DivisionByZero,
    #[error("unbalanced parentheses")]
    UnbalancedParens,
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Replace every whole-word, case-insensitive occurrence of an element
/// name with its numeric value. Longest names are tried first so that
/// "essay final" wins over "essay"; a name never matches inside a larger
/// word. Comma decimal separators are normalized to dots afterwards.
pub fn substitute(formula: &str, values: &[(String, f64)]) -> String {
    let mut names: Vec<(String, f64)> = values
        .iter()
        .map(|(n, v)| (n.trim().to_lowercase(), *v))
        .filter(|(n, _)| !n.is_empty())
        .collect();
    names.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    let chars: Vec<char> = formula.chars().collect();
    let lower: Vec<char> = formula.to_lowercase().chars().collect();
    // to_lowercase can change length for exotic scripts; fall back to a
    // char-wise lowering so the two views stay index-aligned.
    let lower: Vec<char> = if lower.len() == chars.len() {
        lower
    } else {
        chars
            .iter()
            .map(|c| c.to_lowercase().next().unwrap_or(*c))
            .collect()
    };

    let mut out = String::with_capacity(formula.len());
    let mut i = 0;
    while i < chars.len() {
        let boundary_before = i == 0 || !is_word_char(chars[i - 1]);
        let mut matched = false;
        if boundary_before {
            for (name, value) in &names {
                let name_chars: Vec<char> = name.chars().collect();
                let end = i + name_chars.len();
                if end <= lower.len() && lower[i..end] == name_chars[..] {
                    let boundary_after = end == lower.len() || !is_word_char(lower[end]);
                    if boundary_after {
                        out.push_str(&format_value(*value));
                        i = end;
                        matched = true;
                        break;
                    }
                }
            }
        }
        if !matched {
            out.push(chars[i]);
            i += 1;
        }
    }

    out.replace(',', ".")
}

fn format_value(v: f64) -> String {
    // Negative raw scores are clamped upstream, but guard anyway: a bare
    // minus sign pasted mid-expression would change the parse.
    let v = if v.is_finite() && v >= 0.0 { v } else { 0.0 };
    if v.fract() == 0.0 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

/// The safety gate: after substitution only digits, whitespace, the four
/// operators, parentheses and decimal points may remain. Anything else
/// (an unmatched element name, letters, comparisons) is rejected.
pub fn passes_whitelist(expr: &str) -> bool {
    expr.chars()
        .all(|c| c.is_ascii_digit() || c.is_whitespace() || "+-*/().".contains(c))
}

/// Evaluate a sanitized arithmetic expression with standard precedence.
pub fn evaluate(expr: &str) -> Result<f64, FormulaError> {
    if !passes_whitelist(expr) {
        return Err(FormulaError::DisallowedCharacters);
    }
    let tokens: Vec<(usize, char)> = expr
        .char_indices()
        .filter(|(_, c)| !c.is_whitespace())
        .collect();
    let mut parser = Parser { tokens, pos: 0 };
    let value = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        let (at, c) = parser.tokens[parser.pos];
        if c == ')' {
            return Err(FormulaError::UnbalancedParens);
        }
        return Err(FormulaError::UnexpectedToken(at));
    }
    if !value.is_finite() {
        return Err(FormulaError::DivisionByZero);
    }
    Ok(value)
}

struct Parser {
    tokens: Vec<(usize, char)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.tokens.get(self.pos).map(|(_, c)| *c)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn parse_expr(&mut self) -> Result<f64, FormulaError> {
        let mut acc = self.parse_term()?;
        while let Some(op) = self.peek() {
            match op {
                '+' => {
                    self.bump();
                    acc += self.parse_term()?;
                }
                '-' => {
                    self.bump();
                    acc -= self.parse_term()?;
                }
                _ => break,
            }
        }
        Ok(acc)
    }

    fn parse_term(&mut self) -> Result<f64, FormulaError> {
        let mut acc = self.parse_factor()?;
        while let Some(op) = self.peek() {
            match op {
                '*' => {
                    self.bump();
                    acc *= self.parse_factor()?;
                }
                '/' => {
                    self.bump();
                    let rhs = self.parse_factor()?;
                    if rhs == 0.0 {
                        return Err(FormulaError::DivisionByZero);
                    }
                    acc /= rhs;
                }
                _ => break,
            }
        }
        Ok(acc)
    }

    fn parse_factor(&mut self) -> Result<f64, FormulaError> {
        match self.peek() {
            Some('-') => {
                self.bump();
                Ok(-self.parse_factor()?)
            }
            Some('+') => {
                self.bump();
                self.parse_factor()
            }
            Some('(') => {
                self.bump();
                let inner = self.parse_expr()?;
                match self.bump() {
                    Some(')') => Ok(inner),
                    Some(_) => Err(FormulaError::UnbalancedParens),
                    None => Err(FormulaError::UnbalancedParens),
                }
            }
            Some(c) if c.is_ascii_digit() || c == '.' => self.parse_number(),
            Some(_) => {
                let (at, _) = self.tokens[self.pos];
                Err(FormulaError::UnexpectedToken(at))
            }
            None => Err(FormulaError::UnexpectedEnd),
        }
    }

    fn parse_number(&mut self) -> Result<f64, FormulaError> {
        let start = self.pos;
        let mut text = String::new();
        let mut seen_dot = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.bump();
            } else if c == '.' && !seen_dot {
                seen_dot = true;
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        text.parse::<f64>().map_err(|_| {
            let (at, _) = self.tokens[start];
            FormulaError::UnexpectedToken(at)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(pairs: &[(&str, f64)]) -> Vec<(String, f64)> {
        pairs.iter().map(|(n, v)| (n.to_string(), *v)).collect()
    }

    #[test]
    fn substitute_whole_words_case_insensitive() {
        let values = ctx(&[("Essay", 8.0), ("Exam", 12.0)]);
        assert_eq!(substitute("(essay + EXAM) / 2", &values), "(8 + 12) / 2");
    }

    #[test]
    fn substitute_never_matches_inside_words() {
        let values = ctx(&[("test", 4.0)]);
        assert_eq!(substitute("contest + test", &values), "contest + 4");
    }

    #[test]
    fn substitute_prefers_longest_name() {
        let values = ctx(&[("essay", 3.0), ("essay final", 9.0)]);
        assert_eq!(substitute("essay final + essay", &values), "9 + 3");
    }

    #[test]
    fn substitute_normalizes_comma_decimals() {
        let values = ctx(&[("a", 7.5)]);
        assert_eq!(substitute("a + 0,5", &values), "7.5 + 0.5");
    }

    #[test]
    fn whitelist_rejects_leftover_names() {
        assert!(passes_whitelist("(8 + 12) / 2"));
        assert!(!passes_whitelist("(8 + bonus) / 2"));
        assert!(!passes_whitelist("8; drop table grades"));
    }

    #[test]
    fn evaluate_precedence_and_parens() {
        assert_eq!(evaluate("(8 + 12) / 2"), Ok(10.0));
        assert_eq!(evaluate("2 + 3 * 4"), Ok(14.0));
        assert_eq!(evaluate("(2 + 3) * 4"), Ok(20.0));
        assert_eq!(evaluate("10 / 4"), Ok(2.5));
        assert_eq!(evaluate("-3 + 5"), Ok(2.0));
        assert_eq!(evaluate("2 * (1 + 0.5)"), Ok(3.0));
    }

    #[test]
    fn evaluate_rejects_bad_input() {
        assert_eq!(
            evaluate("8 + bonus"),
            Err(FormulaError::DisallowedCharacters)
        );
        assert_eq!(evaluate("8 / 0"), Err(FormulaError::DivisionByZero));
        assert_eq!(evaluate("(8 + 2"), Err(FormulaError::UnbalancedParens));
        assert_eq!(evaluate("8 + 2)"), Err(FormulaError::UnbalancedParens));
        assert_eq!(evaluate(""), Err(FormulaError::UnexpectedEnd));
        assert_eq!(evaluate("4 +"), Err(FormulaError::UnexpectedEnd));
    }
}
