//! Path access into untyped nested documents (`serde_json::Value`).
//!
//! Segments address map keys, or list indexes when the container is a list.
//! `set_path` creates missing (or null) intermediate maps; it fails with
//! [`PathError::NotAContainer`] when an intermediate segment holds a scalar.

use serde_json::{Map, Value as Json};

use crate::error::PathError;

pub trait PathExt {
    fn get_path(&self, path: &[&str]) -> Option<&Json>;
    fn get_path_mut(&mut self, path: &[&str]) -> Option<&mut Json>;
    /// Set `value` at `path`, returning the previous value if there was one.
    fn set_path(&mut self, path: &[&str], value: Json) -> Result<Option<Json>, PathError>;
    /// Remove the value at `path`. Missing intermediates are not an error.
    fn delete_path(&mut self, path: &[&str]) -> Result<Option<Json>, PathError>;

    fn get_str(&self, path: &[&str]) -> Option<&str> {
        self.get_path(path).and_then(Json::as_str)
    }

    fn get_i64(&self, path: &[&str]) -> Option<i64> {
        self.get_path(path).and_then(Json::as_i64)
    }

    /// True if the value at `path` is absent, null, or an empty string, list or map.
    fn is_unset(&self, path: &[&str]) -> bool {
        match self.get_path(path) {
            None | Some(Json::Null) => true,
            Some(Json::String(s)) => s.is_empty(),
            Some(Json::Array(a)) => a.is_empty(),
            Some(Json::Object(o)) => o.is_empty(),
            Some(_) => false,
        }
    }
}

pub(crate) fn type_name(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "list",
        Json::Object(_) => "map",
    }
}

fn render(path: &[&str]) -> String {
    path.join(".")
}

fn index_of(path: &[&str], depth: usize) -> Result<usize, PathError> {
    path[depth]
        .parse::<usize>()
        .map_err(|_| PathError::NotAnIndex { path: render(&path[..depth]), segment: path[depth].to_string() })
}

impl PathExt for Json {
    fn get_path(&self, path: &[&str]) -> Option<&Json> {
        let mut cur = self;
        for seg in path {
            cur = match cur {
                Json::Object(map) => map.get(*seg)?,
                Json::Array(list) => list.get(seg.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(cur)
    }

    fn get_path_mut(&mut self, path: &[&str]) -> Option<&mut Json> {
        let mut cur = self;
        for seg in path {
            cur = match cur {
                Json::Object(map) => map.get_mut(*seg)?,
                Json::Array(list) => list.get_mut(seg.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(cur)
    }

    fn set_path(&mut self, path: &[&str], value: Json) -> Result<Option<Json>, PathError> {
        let (last, parents) = path.split_last().ok_or(PathError::Empty)?;
        let mut cur = self;
        for (depth, seg) in parents.iter().enumerate() {
            if cur.is_null() {
                *cur = Json::Object(Map::new());
            }
            cur = match cur {
                Json::Object(map) => map.entry(seg.to_string()).or_insert(Json::Null),
                Json::Array(list) => {
                    let idx = index_of(path, depth)?;
                    list.get_mut(idx).ok_or(PathError::IndexOutOfRange { path: render(&path[..depth]), index: idx })?
                }
                other => {
                    return Err(PathError::NotAContainer { path: render(&path[..depth]), found: type_name(other) });
                }
            };
        }
        if cur.is_null() {
            *cur = Json::Object(Map::new());
        }
        match cur {
            Json::Object(map) => Ok(map.insert(last.to_string(), value)),
            Json::Array(list) => {
                let idx = index_of(path, parents.len())?;
                let len = list.len();
                match list.get_mut(idx) {
                    Some(slot) => Ok(Some(std::mem::replace(slot, value))),
                    None if idx == len => {
                        list.push(value);
                        Ok(None)
                    }
                    None => Err(PathError::IndexOutOfRange { path: render(parents), index: idx }),
                }
            }
            other => Err(PathError::NotAContainer { path: render(parents), found: type_name(other) }),
        }
    }

    fn delete_path(&mut self, path: &[&str]) -> Result<Option<Json>, PathError> {
        let (last, parents) = path.split_last().ok_or(PathError::Empty)?;
        let mut cur = self;
        for (depth, seg) in parents.iter().enumerate() {
            cur = match cur {
                Json::Object(map) => match map.get_mut(*seg) {
                    Some(next) => next,
                    None => return Ok(None),
                },
                Json::Array(list) => {
                    let idx = index_of(path, depth)?;
                    match list.get_mut(idx) {
                        Some(next) => next,
                        None => return Ok(None),
                    }
                }
                Json::Null => return Ok(None),
                other => {
                    return Err(PathError::NotAContainer { path: render(&path[..depth]), found: type_name(other) });
                }
            };
        }
        match cur {
            Json::Object(map) => Ok(map.remove(*last)),
            Json::Array(list) => {
                let idx = index_of(path, parents.len())?;
                Ok(if idx < list.len() { Some(list.remove(idx)) } else { None })
            }
            Json::Null => Ok(None),
            other => Err(PathError::NotAContainer { path: render(parents), found: type_name(other) }),
        }
    }
}
