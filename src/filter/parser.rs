use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{char, multispace0},
    combinator::{all_consuming, cut, map, value},
    error::{context, VerboseError, VerboseErrorKind},
    multi::many0,
    sequence::{delimited, preceded, terminated},
    IResult,
};
use tracing::instrument;

use super::{Filter, FilterError, FilterResult, Operand, Operator};

type ParserResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

/// Parses a fully parenthesized filter expression.
#[instrument(level = "trace")]
pub fn parse(text: &str) -> FilterResult<Filter> {
    if text.trim().is_empty() {
        return Err(FilterError::Empty);
    }
    match all_consuming(ws(parse_filter))(text) {
        Ok((_, filter)) => Ok(filter),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(to_filter_error(text, e)),
        Err(nom::Err::Incomplete(_)) => Err(FilterError::Syntax {
            filter: text.to_string(),
            position: text.len(),
            message: "unexpected end of input".to_string(),
        }),
    }
}

fn to_filter_error(text: &str, error: VerboseError<&str>) -> FilterError {
    // The innermost context is the most specific description.
    let (rest, message) = error
        .errors
        .iter()
        .find_map(|(rest, kind)| match kind {
            VerboseErrorKind::Context(ctx) => Some((*rest, ctx.to_string())),
            _ => None,
        })
        .or_else(|| {
            error.errors.first().map(|(rest, kind)| {
                let message = match kind {
                    VerboseErrorKind::Char(c) => format!("expected '{}'", c),
                    VerboseErrorKind::Nom(nom::error::ErrorKind::Eof) => {
                        "unexpected trailing characters".to_string()
                    }
                    VerboseErrorKind::Nom(kind) => format!("unexpected input ({:?})", kind),
                    VerboseErrorKind::Context(ctx) => ctx.to_string(),
                };
                (*rest, message)
            })
        })
        .unwrap_or((text, "invalid filter".to_string()));
    FilterError::Syntax {
        filter: text.to_string(),
        position: text.len() - rest.len(),
        message,
    }
}

fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> ParserResult<'a, O>
where
    F: FnMut(&'a str) -> ParserResult<'a, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn parse_filter(input: &str) -> ParserResult<Filter> {
    preceded(
        char('('),
        cut(terminated(
            ws(parse_filter_comp),
            context("expected ')'", char(')')),
        )),
    )(input)
}

fn parse_filter_comp(input: &str) -> ParserResult<Filter> {
    alt((
        map(preceded(char('&'), parse_filter_list), Filter::And),
        map(preceded(char('|'), parse_filter_list), Filter::Or),
        map(
            preceded(char('!'), cut(ws(context("expected '(' after '!'", parse_filter)))),
            |child| Filter::Not(Box::new(child)),
        ),
        parse_item,
    ))(input)
}

fn parse_filter_list(input: &str) -> ParserResult<Vec<Filter>> {
    many0(ws(parse_filter))(input)
}

fn parse_attribute(input: &str) -> ParserResult<&str> {
    context(
        "expected attribute name",
        take_while1(|c: char| !matches!(c, '(' | ')' | '=' | '<' | '>' | '~') && !c.is_whitespace()),
    )(input)
}

fn parse_operator(input: &str) -> ParserResult<Operator> {
    context(
        "unknown operator",
        alt((
            value(Operator::Approx, tag("~=")),
            value(Operator::GreaterEqual, tag(">=")),
            value(Operator::LessEqual, tag("<=")),
            value(Operator::Greater, tag(">")),
            value(Operator::Less, tag("<")),
            value(Operator::Equal, tag("=")),
        )),
    )(input)
}

fn fail<'a, T>(at: &'a str, message: &'static str) -> ParserResult<'a, T> {
    Err(nom::Err::Failure(VerboseError {
        errors: vec![(at, VerboseErrorKind::Context(message))],
    }))
}

/// Value up to the closing parenthesis, split on unescaped `*`.
fn parse_value_parts(input: &str) -> ParserResult<Vec<String>> {
    let mut parts = vec![String::new()];
    let mut chars = input.char_indices();
    while let Some((index, c)) = chars.next() {
        match c {
            ')' => return Ok((&input[index..], parts)),
            '(' => return fail(&input[index..], "unescaped '(' in value"),
            '*' => parts.push(String::new()),
            '\\' => match chars.next() {
                Some((_, escaped)) => push_char(&mut parts, escaped),
                None => return fail(&input[index..], "dangling escape"),
            },
            other => push_char(&mut parts, other),
        }
    }
    Ok((&input[input.len()..], parts))
}

fn push_char(parts: &mut [String], c: char) {
    if let Some(last) = parts.last_mut() {
        last.push(c);
    }
}

fn parse_item(input: &str) -> ParserResult<Filter> {
    let (input, attribute) = parse_attribute(input)?;
    let (input, _) = multispace0(input)?;
    let (input, op) = cut(parse_operator)(input)?;
    let value_start = input;
    let (input, mut parts) = parse_value_parts(input)?;
    let attribute = attribute.to_string();

    if parts.len() == 1 {
        let operand = Operand::new(parts.remove(0));
        return Ok((
            input,
            Filter::Compare {
                attribute,
                op,
                operand,
            },
        ));
    }
    if op != Operator::Equal {
        return fail(value_start, "wildcard only allowed with '='");
    }
    if parts.len() == 2 && parts.iter().all(|p| p.is_empty()) {
        return Ok((input, Filter::Present { attribute }));
    }

    let last = parts.pop().filter(|p| !p.is_empty());
    let initial = Some(parts.remove(0)).filter(|p| !p.is_empty());
    let any = parts.into_iter().filter(|p| !p.is_empty()).collect();
    Ok((
        input,
        Filter::Substring {
            attribute,
            initial,
            any,
            last,
        },
    ))
}
