//! Rule AST: operands, indicator references and the rule tree

use std::collections::HashSet;
use std::fmt;

use crate::indicators::IndicatorType;

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Open,
    High,
    Low,
    Close,
    Volume,
    Constant(f64),
    Indicator(IndicatorRef),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndicatorRef {
    pub indicator: IndicatorType,
    pub field: IndicatorField,
}

/// Which output of a multi-value indicator to read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndicatorField {
    Value,
    MacdLine,
    MacdSignal,
    MacdHistogram,
    BollingerUpper,
    BollingerMiddle,
    BollingerLower,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    CrossAbove {
        left: Operand,
        right: Operand,
    },
    CrossBelow {
        left: Operand,
        right: Operand,
    },
    Above {
        left: Operand,
        right: Operand,
    },
    Below {
        left: Operand,
        right: Operand,
    },
    Between {
        operand: Operand,
        lower: f64,
        upper: f64,
    },
    And(Vec<Rule>),
    Or(Vec<Rule>),
    Not(Box<Rule>),
    Consecutive {
        rule: Box<Rule>,
        count: usize,
    },
    AnyOf {
        rule: Box<Rule>,
        count: usize,
    },
}

impl Operand {
    fn collect_indicators(&self, out: &mut HashSet<IndicatorType>) {
        if let Operand::Indicator(r) = self {
            out.insert(r.indicator);
        }
    }
}

impl Rule {
    /// Every indicator the rule reads, directly or through children
    pub fn indicators(&self) -> HashSet<IndicatorType> {
        let mut out = HashSet::new();
        self.collect_indicators(&mut out);
        out
    }

    pub(crate) fn collect_indicators(&self, out: &mut HashSet<IndicatorType>) {
        match self {
            Rule::CrossAbove { left, right }
            | Rule::CrossBelow { left, right }
            | Rule::Above { left, right }
            | Rule::Below { left, right } => {
                left.collect_indicators(out);
                right.collect_indicators(out);
            }
            Rule::Between { operand, .. } => operand.collect_indicators(out),
            Rule::And(rules) | Rule::Or(rules) => {
                for r in rules {
                    r.collect_indicators(out);
                }
            }
            Rule::Not(rule) | Rule::Consecutive { rule, .. } | Rule::AnyOf { rule, .. } => {
                rule.collect_indicators(out)
            }
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Open => write!(f, "open"),
            Operand::High => write!(f, "high"),
            Operand::Low => write!(f, "low"),
            Operand::Close => write!(f, "close"),
            Operand::Volume => write!(f, "volume"),
            Operand::Constant(v) => write!(f, "{v}"),
            Operand::Indicator(r) => write!(f, "{r}"),
        }
    }
}

impl fmt::Display for IndicatorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.indicator, self.field) {
            (IndicatorType::Macd { fast, slow, signal }, field) => {
                let name = match field {
                    IndicatorField::MacdSignal => "MACD_SIGNAL",
                    IndicatorField::MacdHistogram => "MACD_HIST",
                    _ => "MACD_LINE",
                };
                write!(f, "{name}({fast},{slow},{signal})")
            }
            (IndicatorType::Bollinger { period, mult_x100 }, field) => {
                let name = match field {
                    IndicatorField::BollingerUpper => "BB_UPPER",
                    IndicatorField::BollingerLower => "BB_LOWER",
                    _ => "BB_MIDDLE",
                };
                write!(f, "{name}({period},{})", mult_x100 as f64 / 100.0)
            }
            (other, _) => write!(f, "{other}"),
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, name: &str, rules: &[Rule]) -> fmt::Result {
    write!(f, "{name}(")?;
    for (i, r) in rules.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{r}")?;
    }
    write!(f, ")")
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::CrossAbove { left, right } => write!(f, "CROSS_ABOVE({left}, {right})"),
            Rule::CrossBelow { left, right } => write!(f, "CROSS_BELOW({left}, {right})"),
            Rule::Above { left, right } => write!(f, "ABOVE({left}, {right})"),
            Rule::Below { left, right } => write!(f, "BELOW({left}, {right})"),
            Rule::Between {
                operand,
                lower,
                upper,
            } => write!(f, "BETWEEN({operand}, {lower}, {upper})"),
            Rule::And(rules) => write_list(f, "AND", rules),
            Rule::Or(rules) => write_list(f, "OR", rules),
            Rule::Not(rule) => write!(f, "NOT({rule})"),
            Rule::Consecutive { rule, count } => write!(f, "CONSECUTIVE({rule}, {count})"),
            Rule::AnyOf { rule, count } => write!(f, "ANY_OF({rule}, {count})"),
        }
    }
}
