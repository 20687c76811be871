//! The text line protocol of a sensor feed. One reading per line:
//!
//! ```text
//! @12.5 ORI:alpha,beta,gamma
//! @12.5 ACC:x,y,z
//! @12.5 TOUCH:START|MOVE|END,contact,x,y
//! ```
//!
//! Blank lines and lines starting with `#` are skipped by [`parse_feed`].

use crate::gesture::{SensorEvent, SensorReading, TouchPhase};
use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{char, space1, u32},
    combinator::{all_consuming, map, value},
    error::Error,
    number::complete::double,
    sequence::{preceded, tuple},
    Finish, IResult,
};
use std::fmt;
use std::str::FromStr;

fn parse_triple(s: &str) -> IResult<&str, [f64; 3]> {
    map(
        tuple((
            double,
            preceded(char(','), double),
            preceded(char(','), double),
        )),
        |(a, b, c)| [a, b, c],
    )(s)
}

fn parse_phase(s: &str) -> IResult<&str, TouchPhase> {
    alt((
        value(TouchPhase::Start, tag("START")),
        value(TouchPhase::Move, tag("MOVE")),
        value(TouchPhase::End, tag("END")),
    ))(s)
}

fn parse_touch(s: &str) -> IResult<&str, SensorReading> {
    map(
        tuple((
            parse_phase,
            preceded(char(','), u32),
            preceded(char(','), double),
            preceded(char(','), double),
        )),
        |(phase, contact, x, y)| SensorReading::Touch {
            phase,
            contact,
            x,
            y,
        },
    )(s)
}

fn parse_reading(s: &str) -> IResult<&str, SensorReading> {
    alt((
        preceded(tag("ORI:"), map(parse_triple, SensorReading::Orientation)),
        preceded(tag("ACC:"), map(parse_triple, SensorReading::Acceleration)),
        preceded(tag("TOUCH:"), parse_touch),
    ))(s)
}

fn parse_sensor_event(s: &str) -> IResult<&str, SensorEvent> {
    map(
        tuple((preceded(char('@'), double), preceded(space1, parse_reading))),
        |(at, reading)| SensorEvent { at, reading },
    )(s)
}

impl FromStr for SensorEvent {
    type Err = Error<String>;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match all_consuming(parse_sensor_event)(s.trim()).finish() {
            Ok((_remaining, event)) => Ok(event),
            Err(Error { input, code }) => Err(Error {
                input: input.to_string(),
                code,
            }),
        }
    }
}

impl fmt::Display for SensorEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "@{} ", self.at)?;
        match self.reading {
            SensorReading::Orientation([a, b, c]) => write!(f, "ORI:{},{},{}", a, b, c),
            SensorReading::Acceleration([x, y, z]) => write!(f, "ACC:{},{},{}", x, y, z),
            SensorReading::Touch {
                phase,
                contact,
                x,
                y,
            } => {
                let phase = match phase {
                    TouchPhase::Start => "START",
                    TouchPhase::Move => "MOVE",
                    TouchPhase::End => "END",
                };
                write!(f, "TOUCH:{},{},{},{}", phase, contact, x, y)
            }
        }
    }
}

/// A line of a sensor feed that did not parse.
#[derive(Debug, PartialEq)]
pub struct SensorParseError {
    /// 1-based line number.
    pub line: usize,
    /// What nom choked on.
    pub error: Error<String>,
}

impl fmt::Display for SensorParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "line {}: {:?} at \"{}\"",
            self.line, self.error.code, self.error.input
        )
    }
}

impl std::error::Error for SensorParseError {}

/// Parses a whole feed, stopping at the first bad line.
pub fn parse_feed(text: &str) -> Result<Vec<SensorEvent>, SensorParseError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(i, line)| {
            line.parse::<SensorEvent>()
                .map_err(|error| SensorParseError { line: i + 1, error })
        })
        .collect()
}
