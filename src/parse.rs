//! Grammar for AT response lines, built with `nom` combinators.
use crate::at::*;
use crate::error_codes::CmsError;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_till, take_until};
use nom::character::complete::{line_ending, not_line_ending, one_of};
use nom::combinator::{map, map_res, opt, value};
use nom::multi::{count, many0, many1};
use nom::sequence::{delimited, preceded, terminated};
use nom::IResult;
use num_traits::FromPrimitive;
use std::char::{decode_utf16, REPLACEMENT_CHARACTER};

pub fn parse_string(input: &[u8]) -> IResult<&[u8], String> {
    map(
        delimited(tag("\""), take_until("\""), tag("\"")),
        |data: &[u8]| String::from_utf8_lossy(data).into_owned(),
    )(input)
}

pub fn parse_ucs2_string(input: &[u8]) -> IResult<&[u8], String> {
    map(
        delimited(
            tag("\""),
            many0(map_res(count(one_of("0123456789ABCDEFabcdef"), 4), |data: Vec<char>| {
                let st: String = data.into_iter().collect();
                u16::from_str_radix(&st, 16)
            })),
            tag("\""),
        ),
        |data: Vec<u16>| {
            decode_utf16(data.into_iter())
                .map(|r| r.unwrap_or(REPLACEMENT_CHARACTER))
                .collect::<String>()
        },
    )(input)
}

pub fn parse_integer(input: &[u8]) -> IResult<&[u8], u32> {
    map_res(many1(one_of("0123456789")), |data: Vec<char>| {
        let st: String = data.into_iter().collect();
        st.parse()
    })(input)
}

pub fn parse_range(input: &[u8]) -> IResult<&[u8], (u32, u32)> {
    let (input, i1) = parse_integer(input)?;
    let (input, _) = tag("-")(input)?;
    let (input, i2) = parse_integer(input)?;
    Ok((input, (i1, i2)))
}

pub fn parse_unknown(input: &[u8]) -> IResult<&[u8], String> {
    map(many1(nom::character::complete::none_of(",")), |data: Vec<char>| {
        data.into_iter().collect()
    })(input)
}

pub fn parse_empty(input: &[u8]) -> IResult<&[u8], ()> {
    value((), nom::combinator::success(()))(input)
}

pub fn parse_bracketed_array(input: &[u8]) -> IResult<&[u8], AtValue> {
    map(
        delimited(tag("("), opt(parse_value), tag(")")),
        |v| match v {
            Some(AtValue::Array(ret)) => AtValue::BracketedArray(ret),
            Some(x) => AtValue::BracketedArray(vec![x]),
            None => AtValue::BracketedArray(vec![]),
        },
    )(input)
}

pub fn parse_single_value(input: &[u8]) -> IResult<&[u8], AtValue> {
    alt((
        parse_bracketed_array,
        map(parse_string, AtValue::String),
        map(parse_range, AtValue::Range),
        map(parse_integer, AtValue::Integer),
        map(parse_unknown, AtValue::Unknown),
        map(parse_empty, |_| AtValue::Empty),
    ))(input)
}

pub fn parse_value(input: &[u8]) -> IResult<&[u8], AtValue> {
    let (input, first) = parse_single_value(input)?;
    let (input, others) = many0(preceded(tag(","), parse_single_value))(input)?;
    if others.is_empty() {
        Ok((input, first))
    } else {
        let mut ret = vec![first];
        ret.extend(others);
        Ok((input, AtValue::Array(ret)))
    }
}

pub fn parse_information_response(input: &[u8]) -> IResult<&[u8], (String, AtValue)> {
    let (input, param) = take_till(|c| c == b':')(input)?;
    let (input, _) = tag(":")(input)?;
    let (input, _) = opt(tag(" "))(input)?;
    let (input, response) = parse_value(input)?;
    let param = String::from_utf8_lossy(param).into_owned();
    Ok((input, (param, response)))
}

pub fn parse_response_code(input: &[u8]) -> IResult<&[u8], AtResultCode> {
    alt((
        map(tag("OK"), |_| AtResultCode::Ok),
        map(tag("CONNECT"), |_| AtResultCode::Connect),
        map(tag("RING"), |_| AtResultCode::Ring),
        map(tag("NO CARRIER"), |_| AtResultCode::NoCarrier),
        map(tag("ERROR"), |_| AtResultCode::Error),
        map(tag("NO DIALTONE"), |_| AtResultCode::NoDialtone),
        map(tag("BUSY"), |_| AtResultCode::Busy),
        map(tag("NO ANSWER"), |_| AtResultCode::NoAnswer),
        map(tag("COMMAND NOT SUPPORT"), |_| AtResultCode::CommandNotSupported),
        map(tag("TOO MANY PARAMETERS"), |_| AtResultCode::TooManyParameters),
        map_res(parse_information_response, |(p, r)| {
            if p == "+CME ERROR" {
                if let AtValue::Integer(r) = r {
                    return Ok(AtResultCode::CmeError(r));
                }
            }
            if p == "+CMS ERROR" {
                if let AtValue::Integer(r) = r {
                    return Ok(match CmsError::from_u32(r) {
                        Some(e) => AtResultCode::CmsError(e),
                        None => AtResultCode::CmsErrorUnknown(r),
                    });
                } else if let AtValue::Unknown(s) = r {
                    return Ok(AtResultCode::CmsErrorString(s));
                }
            }
            Err("not a known result code")
        }),
    ))(input)
}

pub fn parse_response_line(input: &[u8]) -> IResult<&[u8], AtResponse> {
    alt((
        map(parse_response_code, AtResponse::ResultCode),
        map(parse_information_response, |(param, response)| {
            AtResponse::InformationResponse { param, response }
        }),
        map_res(not_line_ending, |s: &[u8]| {
            let st = std::str::from_utf8(s).map_err(|_| ())?.trim();
            if st.is_empty() {
                return Err(());
            }
            Ok(AtResponse::Unknown(st.to_string()))
        }),
    ))(input)
}

/// Parse a buffer of one or more CR/LF-terminated lines into their `AtResponse`s, discarding
/// blank lines. Returns `Incomplete`-equivalent (via the `?` on line_ending) until a full line
/// has arrived.
pub fn responses(input: &[u8]) -> IResult<&[u8], Vec<AtResponse>> {
    map(
        many1(terminated(opt(parse_response_line), line_ending)),
        |res| res.into_iter().flatten().collect(),
    )(input)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::at::AtValue::*;
    #[test]
    fn value_string() {
        assert_eq!(parse_string(b"\"testing\"").unwrap(), (&[] as &[_], "testing".into()));
        assert_eq!(
            parse_value(b"\"testing\"").unwrap(),
            (&[] as &[_], AtValue::String("testing".into()))
        );
    }
    #[test]
    fn value_integer() {
        assert_eq!(parse_integer(b"9001").unwrap(), (&[] as &[_], 9001));
        assert_eq!(parse_value(b"9001").unwrap(), (&[] as &[_], AtValue::Integer(9001)));
    }
    #[test]
    fn value_range() {
        assert_eq!(parse_range(b"2-9001").unwrap(), (&[] as &[_], (2, 9001)));
        assert_eq!(parse_value(b"2-9001").unwrap(), (&[] as &[_], AtValue::Range((2, 9001))));
    }
    #[test]
    fn value_empty() {
        assert_eq!(parse_empty(b"").unwrap(), (&[] as &[_], ()));
        assert_eq!(parse_value(b"").unwrap(), (&[] as &[_], AtValue::Empty));
    }
    #[test]
    fn value_unknown() {
        assert_eq!(parse_unknown(b"invalid").unwrap(), (&[] as &[_], "invalid".into()));
        assert_eq!(parse_value(b"invalid").unwrap(), (&[] as &[_], AtValue::Unknown("invalid".into())));
    }
    #[test]
    fn value_complex() {
        assert_eq!(
            parse_value(b"3,0,15,\"GSM\",(),(0-3),,(0-1),invalid,(0-2,15),(\"GSM\",\"IRA\")").unwrap(),
            (
                &[] as &[_],
                Array(vec![
                    Integer(3),
                    Integer(0),
                    Integer(15),
                    String("GSM".into()),
                    BracketedArray(vec![]),
                    BracketedArray(vec![Range((0, 3))]),
                    Empty,
                    BracketedArray(vec![Range((0, 1))]),
                    Unknown("invalid".into()),
                    BracketedArray(vec![Range((0, 2)), Integer(15)]),
                    BracketedArray(vec![String("GSM".into()), String("IRA".into())]),
                ])
            )
        )
    }
    #[test]
    fn full_line() {
        let (rest, resps) = responses(b"+CSQ: 20,99\r\nOK\r\n").unwrap();
        assert_eq!(rest, b"");
        assert_eq!(
            resps,
            vec![
                AtResponse::InformationResponse {
                    param: "+CSQ".into(),
                    response: AtValue::Array(vec![AtValue::Integer(20), AtValue::Integer(99)])
                },
                AtResponse::ResultCode(AtResultCode::Ok),
            ]
        );
    }
    #[test]
    fn cms_error_known() {
        let (_, resp) = parse_response_code(b"+CMS ERROR: 330").unwrap();
        assert_eq!(resp, AtResultCode::CmsError(CmsError::SmscAddressUnknown));
    }
    #[test]
    fn cms_error_unknown_code() {
        let (_, resp) = parse_response_code(b"+CMS ERROR: 909").unwrap();
        assert_eq!(resp, AtResultCode::CmsErrorUnknown(909));
    }
}
