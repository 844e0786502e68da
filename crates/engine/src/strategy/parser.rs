//! Recursive descent parser for the rule DSL.
//!
//! ```text
//! rule     := CROSS_ABOVE(op, op) | CROSS_BELOW(op, op) | ABOVE(op, op) | BELOW(op, op)
//!           | BETWEEN(op, num, num) | AND(rule, rule, ...) | OR(rule, rule, ...)
//!           | NOT(rule) | CONSECUTIVE(rule, int) | ANY_OF(rule, int)
//! op       := open | high | low | close | volume | num | indicator
//! indicator:= SMA(int) | EMA(int) | RSI(int) | ATR(int) | ROC(int) | STDDEV(int)
//!           | STOCH_K(int) | OBV
//!           | MACD_LINE(int,int,int) | MACD_SIGNAL(int,int,int) | MACD_HIST(int,int,int)
//!           | BB_UPPER(int,num) | BB_MIDDLE(int,num) | BB_LOWER(int,num)
//! ```
//!
//! Keywords are case-insensitive. Errors carry the character offset they were found at.

use crate::error::ParseError;
use crate::indicators::IndicatorType;

use super::rule::{IndicatorField, IndicatorRef, Operand, Rule};

/// Deepest rule nesting accepted before parsing gives up
pub const MAX_NESTING: usize = 64;

pub fn parse_rule(input: &str) -> Result<Rule, ParseError> {
    let mut parser = Parser::new(input);
    let rule = parser.parse_rule()?;
    parser.skip_whitespace();
    if parser.pos < input.len() {
        return Err(parser.error(format!("unexpected trailing input '{}'", parser.remaining())));
    }
    Ok(rule)
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            depth: 0,
        }
    }

    fn remaining(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.remaining().chars().next()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
            position: self.pos,
        }
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.advance();
        }
    }

    fn expect_char(&mut self, expected: char) -> Result<(), ParseError> {
        self.skip_whitespace();
        match self.peek() {
            Some(ch) if ch == expected => {
                self.advance();
                Ok(())
            }
            Some(ch) => Err(self.error(format!("expected '{expected}', found '{ch}'"))),
            None => Err(self.error(format!("expected '{expected}', found end of input"))),
        }
    }

    /// Consume `,` and report whether one was there
    fn eat_comma(&mut self) -> bool {
        self.skip_whitespace();
        if self.peek() == Some(',') {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Read an identifier, returned upper-cased with its start offset
    fn word(&mut self) -> (String, usize) {
        self.skip_whitespace();
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            self.advance();
        }
        (self.input[start..self.pos].to_ascii_uppercase(), start)
    }

    fn parse_number(&mut self) -> Result<f64, ParseError> {
        self.skip_whitespace();
        let start = self.pos;
        if matches!(self.peek(), Some('-') | Some('+')) {
            self.advance();
        }
        let mut digits = 0;
        let mut has_dot = false;
        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() {
                digits += 1;
            } else if ch == '.' && !has_dot {
                has_dot = true;
            } else {
                break;
            }
            self.advance();
        }
        if digits == 0 {
            return Err(ParseError {
                message: "expected number".to_string(),
                position: start,
            });
        }
        let text = &self.input[start..self.pos];
        text.parse::<f64>().map_err(|_| ParseError {
            message: format!("invalid number: {text}"),
            position: start,
        })
    }

    fn parse_integer(&mut self) -> Result<usize, ParseError> {
        self.skip_whitespace();
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
        }
        if start == self.pos {
            return Err(self.error("expected integer"));
        }
        let text = &self.input[start..self.pos];
        text.parse::<usize>().map_err(|_| ParseError {
            message: format!("invalid integer: {text}"),
            position: start,
        })
    }

    fn parse_rule(&mut self) -> Result<Rule, ParseError> {
        if self.depth >= MAX_NESTING {
            self.skip_whitespace();
            return Err(self.error(format!("rules nested deeper than {MAX_NESTING} levels")));
        }
        self.depth += 1;
        let rule = self.parse_rule_body();
        self.depth -= 1;
        rule
    }

    fn parse_rule_body(&mut self) -> Result<Rule, ParseError> {
        let (keyword, start) = self.word();
        if keyword.is_empty() {
            return Err(match self.peek() {
                Some(ch) => self.error(format!("expected rule, found '{ch}'")),
                None => self.error("expected rule, found end of input"),
            });
        }
        self.expect_char('(')?;

        let rule = match keyword.as_str() {
            "CROSS_ABOVE" | "CROSS_BELOW" | "ABOVE" | "BELOW" => {
                let left = self.parse_operand()?;
                self.expect_char(',')?;
                let right = self.parse_operand()?;
                match keyword.as_str() {
                    "CROSS_ABOVE" => Rule::CrossAbove { left, right },
                    "CROSS_BELOW" => Rule::CrossBelow { left, right },
                    "ABOVE" => Rule::Above { left, right },
                    _ => Rule::Below { left, right },
                }
            }
            "BETWEEN" => {
                let operand = self.parse_operand()?;
                self.expect_char(',')?;
                let bounds_at = self.pos;
                let lower = self.parse_number()?;
                self.expect_char(',')?;
                let upper = self.parse_number()?;
                if lower > upper {
                    return Err(ParseError {
                        message: format!("lower bound {lower} exceeds upper bound {upper}"),
                        position: bounds_at,
                    });
                }
                Rule::Between {
                    operand,
                    lower,
                    upper,
                }
            }
            "AND" | "OR" => {
                let mut children = vec![self.parse_rule()?];
                while self.eat_comma() {
                    children.push(self.parse_rule()?);
                }
                if children.len() < 2 {
                    return Err(ParseError {
                        message: format!("{keyword} needs at least two rules"),
                        position: start,
                    });
                }
                if keyword == "AND" {
                    Rule::And(children)
                } else {
                    Rule::Or(children)
                }
            }
            "NOT" => Rule::Not(Box::new(self.parse_rule()?)),
            "CONSECUTIVE" | "ANY_OF" => {
                let rule = Box::new(self.parse_rule()?);
                self.expect_char(',')?;
                let count_at = self.pos;
                let count = self.parse_integer()?;
                if count == 0 {
                    return Err(ParseError {
                        message: format!("{keyword} count must be at least 1"),
                        position: count_at,
                    });
                }
                if keyword == "CONSECUTIVE" {
                    Rule::Consecutive { rule, count }
                } else {
                    Rule::AnyOf { rule, count }
                }
            }
            _ => {
                return Err(ParseError {
                    message: format!("unknown rule '{keyword}'"),
                    position: start,
                })
            }
        };

        self.expect_char(')')?;
        Ok(rule)
    }

    fn parse_operand(&mut self) -> Result<Operand, ParseError> {
        self.skip_whitespace();
        match self.peek() {
            Some(c) if c.is_ascii_digit() || c == '-' || c == '+' || c == '.' => {
                return Ok(Operand::Constant(self.parse_number()?));
            }
            None => return Err(self.error("expected operand, found end of input")),
            _ => {}
        }

        let (name, start) = self.word();
        let operand = match name.as_str() {
            "OPEN" => Operand::Open,
            "HIGH" => Operand::High,
            "LOW" => Operand::Low,
            "CLOSE" => Operand::Close,
            "VOLUME" => Operand::Volume,
            "OBV" => indicator(IndicatorType::Obv, IndicatorField::Value),
            "SMA" | "EMA" | "RSI" | "ATR" | "ROC" | "STDDEV" | "STOCH_K" => {
                self.expect_char('(')?;
                let n = self.parse_integer()?;
                self.expect_char(')')?;
                let kind = match name.as_str() {
                    "SMA" => IndicatorType::Sma(n),
                    "EMA" => IndicatorType::Ema(n),
                    "RSI" => IndicatorType::Rsi(n),
                    "ATR" => IndicatorType::Atr(n),
                    "ROC" => IndicatorType::Roc(n),
                    "STDDEV" => IndicatorType::Stddev(n),
                    _ => IndicatorType::StochK(n),
                };
                indicator(kind, IndicatorField::Value)
            }
            "MACD_LINE" | "MACD_SIGNAL" | "MACD_HIST" => {
                self.expect_char('(')?;
                let fast = self.parse_integer()?;
                self.expect_char(',')?;
                let slow = self.parse_integer()?;
                self.expect_char(',')?;
                let signal = self.parse_integer()?;
                self.expect_char(')')?;
                let field = match name.as_str() {
                    "MACD_LINE" => IndicatorField::MacdLine,
                    "MACD_SIGNAL" => IndicatorField::MacdSignal,
                    _ => IndicatorField::MacdHistogram,
                };
                indicator(IndicatorType::Macd { fast, slow, signal }, field)
            }
            "BB_UPPER" | "BB_MIDDLE" | "BB_LOWER" => {
                self.expect_char('(')?;
                let period = self.parse_integer()?;
                self.expect_char(',')?;
                let mult_at = self.pos;
                let mult = self.parse_number()?;
                self.expect_char(')')?;
                if mult <= 0.0 {
                    return Err(ParseError {
                        message: format!("band multiplier must be positive, found {mult}"),
                        position: mult_at,
                    });
                }
                let field = match name.as_str() {
                    "BB_UPPER" => IndicatorField::BollingerUpper,
                    "BB_MIDDLE" => IndicatorField::BollingerMiddle,
                    _ => IndicatorField::BollingerLower,
                };
                let kind = IndicatorType::Bollinger {
                    period,
                    mult_x100: (mult * 100.0).round() as u32,
                };
                indicator(kind, field)
            }
            "" => {
                return Err(match self.peek() {
                    Some(ch) => self.error(format!("expected operand, found '{ch}'")),
                    None => self.error("expected operand, found end of input"),
                })
            }
            _ => {
                return Err(ParseError {
                    message: format!("unknown operand '{name}'"),
                    position: start,
                })
            }
        };
        Ok(operand)
    }
}

fn indicator(indicator: IndicatorType, field: IndicatorField) -> Operand {
    Operand::Indicator(IndicatorRef { indicator, field })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ind(kind: IndicatorType, field: IndicatorField) -> Operand {
        indicator(kind, field)
    }

    const MACD: IndicatorType = IndicatorType::Macd {
        fast: 12,
        slow: 26,
        signal: 9,
    };

    #[test]
    fn test_parse_cross_with_macd() {
        let rule = parse_rule("CROSS_ABOVE(MACD_LINE(12,26,9), MACD_SIGNAL(12, 26, 9))").unwrap();
        assert_eq!(
            rule,
            Rule::CrossAbove {
                left: ind(MACD, IndicatorField::MacdLine),
                right: ind(MACD, IndicatorField::MacdSignal),
            }
        );
    }

    #[test]
    fn test_keywords_are_case_insensitive() {
        let upper = parse_rule("AND(ABOVE(close, EMA(50)), BELOW(RSI(14), 70))").unwrap();
        let lower = parse_rule("and( above(Close, ema(50)) , below(rsi(14), 70) )").unwrap();
        assert_eq!(upper, lower);
    }

    #[test]
    fn test_parse_nested_temporal_and_bands() {
        let rule =
            parse_rule("OR(CONSECUTIVE(BELOW(close, BB_LOWER(20, 2.5)), 3), ANY_OF(NOT(ABOVE(volume, OBV)), 5))")
                .unwrap();
        let Rule::Or(children) = rule else {
            panic!("expected OR");
        };
        assert_eq!(children.len(), 2);
        match &children[0] {
            Rule::Consecutive { rule, count } => {
                assert_eq!(*count, 3);
                assert_eq!(
                    **rule,
                    Rule::Below {
                        left: Operand::Close,
                        right: ind(
                            IndicatorType::Bollinger {
                                period: 20,
                                mult_x100: 250
                            },
                            IndicatorField::BollingerLower
                        ),
                    }
                );
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(children[1], Rule::AnyOf { count: 5, .. }));
    }

    #[test]
    fn test_parse_between_and_constants() {
        let rule = parse_rule("BETWEEN(RSI(14), 30, 70.5)").unwrap();
        assert_eq!(
            rule,
            Rule::Between {
                operand: ind(IndicatorType::Rsi(14), IndicatorField::Value),
                lower: 30.0,
                upper: 70.5,
            }
        );
        let rule = parse_rule("ABOVE(ROC(10), -1.5)").unwrap();
        assert!(matches!(
            rule,
            Rule::Above {
                right: Operand::Constant(v),
                ..
            } if v == -1.5
        ));
    }

    #[test]
    fn test_error_positions() {
        let err = parse_rule("ABOVE(close, FOO(3))").unwrap_err();
        assert_eq!(err.position, 13);
        assert!(err.message.contains("FOO"));

        let err = parse_rule("ABOVE(close, SMA(20)").unwrap_err();
        assert_eq!(err.position, 20);
        assert!(err.message.contains("')'"));

        let err = parse_rule("CROSS_ABOVE(close, SMA(x))").unwrap_err();
        assert_eq!(err.position, 23);
    }

    #[test]
    fn test_rejects_bad_shapes() {
        assert!(parse_rule("AND(ABOVE(close, 1))").is_err());
        assert!(parse_rule("CONSECUTIVE(ABOVE(close, 1), 0)").is_err());
        assert!(parse_rule("BETWEEN(close, 10, 5)").is_err());
        assert!(parse_rule("ABOVE(close, 1) extra").is_err());
        assert!(parse_rule("").is_err());
        assert!(parse_rule("df['close'] > 5").is_err());
    }

    #[test]
    fn test_nesting_limit() {
        let nested = |depth: usize| {
            format!("{}ABOVE(close, 1){}", "NOT(".repeat(depth), ")".repeat(depth))
        };
        assert!(parse_rule(&nested(MAX_NESTING - 1)).is_ok());

        let err = parse_rule(&nested(MAX_NESTING)).unwrap_err();
        assert!(err.message.contains("nested deeper"));
        assert_eq!(err.position, 4 * MAX_NESTING);

        // deep enough to exhaust the stack without the limit
        let err = parse_rule(&nested(5_000)).unwrap_err();
        assert!(err.message.contains("nested deeper"));
    }

    #[test]
    fn test_display_round_trips_through_parser() {
        let text = "AND(CROSS_ABOVE(SMA(20), SMA(50)), BETWEEN(STOCH_K(14), 20, 80), ABOVE(ATR(14), STDDEV(10)))";
        let rule = parse_rule(text).unwrap();
        assert_eq!(rule.to_string(), text);
    }
}
