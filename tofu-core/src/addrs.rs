//! Addresses - Identifying resources, resource instances and outputs
//!
//! Addresses render to the canonical string form used throughout state
//! storage (e.g. `module.net["a"].aws_subnet.private[0]`) and parse back from
//! that same form, so `s.parse::<AbsResourceInstance>()?.to_string() == s`
//! for every canonical string.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error produced when an address string cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid address '{input}' at position {position}: {message}")]
pub struct AddrError {
    pub input: String,
    pub position: usize,
    pub message: String,
}

/// Key selecting one instance of a counted or for_each'd object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InstanceKey {
    Int(u64),
    Str(String),
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceKey::Int(i) => write!(f, "[{}]", i),
            InstanceKey::Str(s) => {
                f.write_str("[\"")?;
                for c in s.chars() {
                    match c {
                        '"' => f.write_str("\\\"")?,
                        '\\' => f.write_str("\\\\")?,
                        c => write!(f, "{}", c)?,
                    }
                }
                f.write_str("\"]")
            }
        }
    }
}

/// One `module.<name>[key]` step of a module instance path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleInstanceStep {
    pub name: String,
    pub key: Option<InstanceKey>,
}

/// Path from the root module to a module instance. Empty means the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleInstance(pub Vec<ModuleInstanceStep>);

impl ModuleInstance {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Return the address of a child module instance
    pub fn child(&self, name: impl Into<String>, key: Option<InstanceKey>) -> Self {
        let mut steps = self.0.clone();
        steps.push(ModuleInstanceStep {
            name: name.into(),
            key,
        });
        Self(steps)
    }
}

impl fmt::Display for ModuleInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "module.{}", step.name)?;
            if let Some(key) = &step.key {
                write!(f, "{}", key)?;
            }
        }
        Ok(())
    }
}

/// Whether a resource is managed or a read-only data source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceMode {
    Managed,
    Data,
}

/// A resource relative to its containing module
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Resource {
    pub mode: ResourceMode,
    /// Resource type (e.g., "aws_instance")
    pub resource_type: String,
    /// Resource name from configuration
    pub name: String,
}

impl Resource {
    pub fn managed(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            mode: ResourceMode::Managed,
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }

    pub fn data(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            mode: ResourceMode::Data,
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.mode == ResourceMode::Data {
            f.write_str("data.")?;
        }
        write!(f, "{}.{}", self.resource_type, self.name)
    }
}

/// A resource in a specific module instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AbsResource {
    pub module: ModuleInstance,
    pub resource: Resource,
}

impl AbsResource {
    pub fn new(module: ModuleInstance, resource: Resource) -> Self {
        Self { module, resource }
    }

    pub fn instance(&self, key: Option<InstanceKey>) -> AbsResourceInstance {
        AbsResourceInstance {
            resource: self.clone(),
            key,
        }
    }
}

impl fmt::Display for AbsResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.module.is_root() {
            write!(f, "{}.", self.module)?;
        }
        write!(f, "{}", self.resource)
    }
}

impl FromStr for AbsResource {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parser = Parser::new(s);
        let (resource, key_pos) = parser.resource_instance()?;
        if resource.key.is_some() {
            return Err(parser.error_at(key_pos, "resource address must not have an instance key"));
        }
        Ok(resource.resource)
    }
}

/// One instance of a resource; the unit tracked by a single state entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AbsResourceInstance {
    pub resource: AbsResource,
    pub key: Option<InstanceKey>,
}

impl AbsResourceInstance {
    /// Shorthand for a root-module managed resource instance without a key
    pub fn managed(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        AbsResource::new(ModuleInstance::root(), Resource::managed(resource_type, name))
            .instance(None)
    }

    pub fn with_key(mut self, key: InstanceKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn containing_resource(&self) -> &AbsResource {
        &self.resource
    }
}

impl fmt::Display for AbsResourceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.resource)?;
        if let Some(key) = &self.key {
            write!(f, "{}", key)?;
        }
        Ok(())
    }
}

impl FromStr for AbsResourceInstance {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Parser::new(s).resource_instance().map(|(addr, _)| addr)
    }
}

impl TryFrom<String> for AbsResourceInstance {
    type Error = AddrError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AbsResourceInstance> for String {
    fn from(value: AbsResourceInstance) -> Self {
        value.to_string()
    }
}

/// A root module output value, identified by name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputValue {
    pub name: String,
}

impl OutputValue {
    /// Validate a bare output name
    pub fn parse_name(name: &str) -> Result<Self, AddrError> {
        let mut parser = Parser::new(name);
        let name = parser.ident()?;
        parser.expect_end()?;
        Ok(Self { name })
    }
}

impl fmt::Display for OutputValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "output.{}", self.name)
    }
}

impl FromStr for OutputValue {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parser = Parser::new(s);
        let keyword = parser.ident()?;
        if keyword != "output" {
            return Err(parser.error_at(0, "expected 'output'"));
        }
        parser.expect('.')?;
        let name = parser.ident()?;
        parser.expect_end()?;
        Ok(Self { name })
    }
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn error_at(&self, position: usize, message: impl Into<String>) -> AddrError {
        AddrError {
            input: self.input.to_string(),
            position,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn expect(&mut self, want: char) -> Result<(), AddrError> {
        match self.peek() {
            Some(c) if c == want => {
                self.pos += c.len_utf8();
                Ok(())
            }
            _ => Err(self.error_at(self.pos, format!("expected '{}'", want))),
        }
    }

    fn expect_end(&self) -> Result<(), AddrError> {
        if self.pos == self.input.len() {
            Ok(())
        } else {
            Err(self.error_at(self.pos, "unexpected trailing characters"))
        }
    }

    fn ident(&mut self) -> Result<String, AddrError> {
        let start = self.pos;
        match self.peek() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                self.pos += 1;
            }
            _ => return Err(self.error_at(start, "expected identifier")),
        }
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                self.pos += 1;
            } else {
                break;
            }
        }
        Ok(self.input[start..self.pos].to_string())
    }

    fn instance_key(&mut self) -> Result<Option<InstanceKey>, AddrError> {
        if self.peek() != Some('[') {
            return Ok(None);
        }
        self.pos += 1;
        let key = match self.peek() {
            Some('"') => {
                self.pos += 1;
                let mut s = String::new();
                loop {
                    let at = self.pos;
                    match self.bump() {
                        Some('"') => break,
                        Some('\\') => match self.bump() {
                            Some(c @ ('"' | '\\')) => s.push(c),
                            _ => return Err(self.error_at(at, "invalid escape sequence")),
                        },
                        Some(c) => s.push(c),
                        None => return Err(self.error_at(at, "unterminated string key")),
                    }
                }
                InstanceKey::Str(s)
            }
            Some(c) if c.is_ascii_digit() => {
                let start = self.pos;
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.pos += 1;
                }
                let digits = &self.input[start..self.pos];
                let n = digits
                    .parse::<u64>()
                    .map_err(|_| self.error_at(start, "instance key out of range"))?;
                InstanceKey::Int(n)
            }
            _ => return Err(self.error_at(self.pos, "expected instance key")),
        };
        self.expect(']')?;
        Ok(Some(key))
    }

    /// Parse a full resource instance address, returning it along with the
    /// position of its instance key (for error reporting).
    fn resource_instance(&mut self) -> Result<(AbsResourceInstance, usize), AddrError> {
        let mut module = ModuleInstance::root();
        loop {
            let first = self.ident()?;
            self.expect('.')?;
            if first == "module" {
                let name = self.ident()?;
                let key = self.instance_key()?;
                self.expect('.')?;
                module.0.push(ModuleInstanceStep { name, key });
                continue;
            }

            let resource = if first == "data" {
                let resource_type = self.ident()?;
                self.expect('.')?;
                Resource::data(resource_type, self.ident()?)
            } else {
                Resource::managed(first, self.ident()?)
            };
            let key_pos = self.pos;
            let key = self.instance_key()?;
            self.expect_end()?;
            let addr = AbsResource::new(module, resource).instance(key);
            return Ok((addr, key_pos));
        }
    }
}
