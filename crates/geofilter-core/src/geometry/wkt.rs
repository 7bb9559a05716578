//! Well-known text reading and writing
//!
//! Accepts 2D, Z, M and ZM coordinates (extra ordinates are dropped) and an
//! optional EWKT `SRID=n;` prefix.

use std::fmt::Write;

use super::{Coord, Geometry};
use crate::error::{FilterError, Result};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Number(f64),
    Open,
    Close,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            '(' => {
                tokens.push(Token::Open);
                chars.next();
            }
            ')' => {
                tokens.push(Token::Close);
                chars.next();
            }
            ',' => {
                tokens.push(Token::Comma);
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            c if c.is_ascii_alphabetic() => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if !c.is_ascii_alphabetic() {
                        break;
                    }
                    word.push(c.to_ascii_uppercase());
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
            c if c.is_ascii_digit() || c == '-' || c == '+' || c == '.' => {
                let mut text = String::new();
                while let Some(&c) = chars.peek() {
                    if !(c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E')) {
                        break;
                    }
                    text.push(c);
                    chars.next();
                }
                let value = text
                    .parse::<f64>()
                    .map_err(|_| wkt_error(format!("bad number '{}'", text)))?;
                tokens.push(Token::Number(value));
            }
            other => return Err(wkt_error(format!("unexpected character '{}'", other))),
        }
    }
    Ok(tokens)
}

fn wkt_error(reason: impl Into<String>) -> FilterError {
    FilterError::GeometryInvalid {
        reason: format!("WKT: {}", reason.into()),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            other => Err(wkt_error(format!("expected {:?}, found {:?}", expected, other))),
        }
    }

    /// Consume `Z`, `M` or `ZM` dimension markers
    fn skip_dimension(&mut self) {
        if let Some(Token::Word(w)) = self.peek() {
            if matches!(w.as_str(), "Z" | "M" | "ZM") {
                self.pos += 1;
            }
        }
    }

    /// Returns true when the geometry is `EMPTY`
    fn take_empty(&mut self) -> bool {
        if let Some(Token::Word(w)) = self.peek() {
            if w == "EMPTY" {
                self.pos += 1;
                return true;
            }
        }
        false
    }

    fn coord(&mut self) -> Result<Coord> {
        let mut ordinates = Vec::with_capacity(4);
        while let Some(Token::Number(n)) = self.peek() {
            ordinates.push(*n);
            self.pos += 1;
        }
        match ordinates.as_slice() {
            [x, y, ..] => Ok(Coord::new(*x, *y)),
            _ => Err(wkt_error("coordinate needs at least two ordinates")),
        }
    }

    fn coord_list(&mut self) -> Result<Vec<Coord>> {
        self.expect(Token::Open)?;
        let mut coords = vec![self.coord()?];
        while self.peek() == Some(&Token::Comma) {
            self.pos += 1;
            coords.push(self.coord()?);
        }
        self.expect(Token::Close)?;
        Ok(coords)
    }

    /// MULTIPOINT accepts both `(1 2, 3 4)` and `((1 2), (3 4))`
    fn multipoint_list(&mut self) -> Result<Vec<Coord>> {
        self.expect(Token::Open)?;
        let mut coords = Vec::new();
        loop {
            if self.peek() == Some(&Token::Open) {
                self.pos += 1;
                coords.push(self.coord()?);
                self.expect(Token::Close)?;
            } else {
                coords.push(self.coord()?);
            }
            if self.peek() == Some(&Token::Comma) {
                self.pos += 1;
            } else {
                break;
            }
        }
        self.expect(Token::Close)?;
        Ok(coords)
    }

    fn nested<T>(&mut self, mut item: impl FnMut(&mut Self) -> Result<T>) -> Result<Vec<T>> {
        self.expect(Token::Open)?;
        let mut items = vec![item(self)?];
        while self.peek() == Some(&Token::Comma) {
            self.pos += 1;
            items.push(item(self)?);
        }
        self.expect(Token::Close)?;
        Ok(items)
    }

    fn geometry(&mut self) -> Result<Geometry> {
        let kind = match self.next() {
            Some(Token::Word(w)) => w,
            other => return Err(wkt_error(format!("expected geometry type, found {:?}", other))),
        };
        self.skip_dimension();
        let empty = self.take_empty();
        let geometry = match kind.as_str() {
            "POINT" if empty => Geometry::MultiPoint(Vec::new()),
            "POINT" => {
                self.expect(Token::Open)?;
                let c = self.coord()?;
                self.expect(Token::Close)?;
                Geometry::Point(c)
            }
            "LINESTRING" if empty => Geometry::LineString(Vec::new()),
            "LINESTRING" => Geometry::LineString(self.coord_list()?),
            "POLYGON" if empty => Geometry::Polygon(Vec::new()),
            "POLYGON" => Geometry::Polygon(self.nested(Self::coord_list)?),
            "MULTIPOINT" if empty => Geometry::MultiPoint(Vec::new()),
            "MULTIPOINT" => Geometry::MultiPoint(self.multipoint_list()?),
            "MULTILINESTRING" if empty => Geometry::MultiLineString(Vec::new()),
            "MULTILINESTRING" => Geometry::MultiLineString(self.nested(Self::coord_list)?),
            "MULTIPOLYGON" if empty => Geometry::MultiPolygon(Vec::new()),
            "MULTIPOLYGON" => {
                Geometry::MultiPolygon(self.nested(|p| p.nested(Self::coord_list))?)
            }
            "GEOMETRYCOLLECTION" if empty => Geometry::Collection(Vec::new()),
            "GEOMETRYCOLLECTION" => Geometry::Collection(self.nested(Self::geometry)?),
            other => return Err(wkt_error(format!("unknown geometry type {}", other))),
        };
        Ok(geometry)
    }
}

/// Parse WKT or EWKT text
pub fn parse_wkt(input: &str) -> Result<Geometry> {
    let body = match input.trim().split_once(';') {
        Some((prefix, rest)) if prefix.trim().to_ascii_uppercase().starts_with("SRID=") => rest,
        _ => input,
    };
    let mut parser = Parser {
        tokens: tokenize(body)?,
        pos: 0,
    };
    let geometry = parser.geometry()?;
    if parser.pos != parser.tokens.len() {
        return Err(wkt_error("trailing content after geometry"));
    }
    Ok(geometry)
}

fn write_coords(out: &mut String, coords: &[Coord]) {
    out.push('(');
    for (i, c) in coords.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{} {}", c.x, c.y);
    }
    out.push(')');
}

fn write_rings(out: &mut String, rings: &[Vec<Coord>]) {
    out.push('(');
    for (i, ring) in rings.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write_coords(out, ring);
    }
    out.push(')');
}

fn write_geometry(out: &mut String, geometry: &Geometry) {
    if geometry.is_empty() {
        let _ = write!(out, "{} EMPTY", geometry.type_name().to_ascii_uppercase());
        return;
    }
    match geometry {
        Geometry::Point(c) => {
            let _ = write!(out, "POINT ({} {})", c.x, c.y);
        }
        Geometry::LineString(coords) => {
            out.push_str("LINESTRING ");
            write_coords(out, coords);
        }
        Geometry::Polygon(rings) => {
            out.push_str("POLYGON ");
            write_rings(out, rings);
        }
        Geometry::MultiPoint(coords) => {
            out.push_str("MULTIPOINT ");
            write_coords(out, coords);
        }
        Geometry::MultiLineString(lines) => {
            out.push_str("MULTILINESTRING ");
            write_rings(out, lines);
        }
        Geometry::MultiPolygon(polys) => {
            out.push_str("MULTIPOLYGON (");
            for (i, poly) in polys.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_rings(out, poly);
            }
            out.push(')');
        }
        Geometry::Collection(parts) => {
            out.push_str("GEOMETRYCOLLECTION (");
            for (i, part) in parts.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_geometry(out, part);
            }
            out.push(')');
        }
    }
}

/// Format a geometry as WKT
pub fn to_wkt(geometry: &Geometry) -> String {
    let mut out = String::new();
    write_geometry(&mut out, geometry);
    out
}
