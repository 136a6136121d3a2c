//! Test-score extraction from tester output.
//!
//! Two grammars are recognized, selected per plugin:
//!
//! - CTest: a line `<pct>% tests passed, <failed> tests failed out of <total>`.
//! - PyUnit: a line `Ran <total> test(s)` followed by `OK` or
//!   `FAILED (failures=<f>, errors=<e>)`.
//!
//! Output matching neither yields [`ScoreParse::Unparseable`].

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestScore {
    pub passed: u32,
    pub total: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreFormat {
    #[default]
    Ctest,
    Pyunit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreParse {
    Score(TestScore),
    Unparseable,
}

static CTEST_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(\d+)% tests passed, (\d+) tests failed out of (\d+)\s*$").unwrap()
});
static PYUNIT_RAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^Ran (\d+) tests? in ").unwrap());
static PYUNIT_FAILED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^FAILED \((?:failures=(\d+))?(?:, )?(?:errors=(\d+))?").unwrap()
});
static PYUNIT_OK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^OK\b").unwrap());

pub fn parse_score(format: ScoreFormat, output: &str) -> ScoreParse {
    match format {
        ScoreFormat::Ctest => parse_ctest(output),
        ScoreFormat::Pyunit => parse_pyunit(output),
    }
}

fn parse_ctest(output: &str) -> ScoreParse {
    let Some(caps) = CTEST_SUMMARY.captures_iter(output).last() else {
        return ScoreParse::Unparseable;
    };
    let (Some(failed), Some(total)) = (number(&caps, 2), number(&caps, 3)) else {
        return ScoreParse::Unparseable;
    };
    if failed > total {
        return ScoreParse::Unparseable;
    }
    ScoreParse::Score(TestScore {
        passed: total - failed,
        total,
    })
}

fn parse_pyunit(output: &str) -> ScoreParse {
    let Some(total) = PYUNIT_RAN.captures(output).and_then(|caps| number(&caps, 1)) else {
        return ScoreParse::Unparseable;
    };
    let failures = if let Some(caps) = PYUNIT_FAILED.captures(output) {
        number(&caps, 1).unwrap_or(0) + number(&caps, 2).unwrap_or(0)
    } else if PYUNIT_OK.is_match(output) {
        0
    } else {
        return ScoreParse::Unparseable;
    };
    if failures > total {
        return ScoreParse::Unparseable;
    }
    ScoreParse::Score(TestScore {
        passed: total - failures,
        total,
    })
}

fn number(caps: &regex::Captures<'_>, idx: usize) -> Option<u32> {
    caps.get(idx).and_then(|m| m.as_str().parse().ok())
}
