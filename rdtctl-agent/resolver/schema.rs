//! Per cache-ID allocation containers and their schemata rendering

use std::collections::BTreeMap;
use std::fmt::Write;

use rdtctl_raw::Bitmask;

use crate::common::CacheLevel;
use crate::enum_with_data;

enum_with_data! {
    /// Cache allocation schema type
    pub enum CatSchemaType: &'static str {
        Unified => ("unified", ""),
        Code => ("code", "CODE"),
        Data => ("data", "DATA"),
    }
    impl resctrl_suffix -> &'static str
}

/// Allocation of one cache ID, optionally split into code and data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatAllocation<T> {
    pub unified: Option<T>,
    pub code: Option<T>,
    pub data: Option<T>,
}

impl<T> Default for CatAllocation<T> {
    fn default() -> Self {
        Self {
            unified: None,
            code: None,
            data: None,
        }
    }
}

impl<T: Copy> CatAllocation<T> {
    pub fn unified(value: T) -> Self {
        Self {
            unified: Some(value),
            ..Default::default()
        }
    }

    pub fn get(&self, typ: CatSchemaType) -> Option<T> {
        match typ {
            CatSchemaType::Unified => self.unified,
            CatSchemaType::Code => self.code,
            CatSchemaType::Data => self.data,
        }
    }

    pub fn set(&mut self, typ: CatSchemaType, value: T) {
        match typ {
            CatSchemaType::Unified => self.unified = Some(value),
            CatSchemaType::Code => self.code = Some(value),
            CatSchemaType::Data => self.data = Some(value),
        }
    }

    /// Allocation of a type, falling back to the unified one for code and
    /// data
    pub fn get_effective(&self, typ: CatSchemaType) -> Option<T> {
        self.get(typ).or(self.unified)
    }
}

/// Resolved cache allocation of one cache level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatSchema {
    pub level: CacheLevel,
    pub alloc: BTreeMap<u64, CatAllocation<Bitmask>>,
}

impl CatSchema {
    pub fn new(level: CacheLevel) -> Self {
        Self {
            level,
            alloc: BTreeMap::new(),
        }
    }

    /// Render one schemata line, e.g. `L3CODE:0=ff;1=ff\n`
    ///
    /// Returns an empty string if no cache ID has an allocation of the type.
    pub fn to_schemata_line(&self, typ: CatSchemaType) -> String {
        let mut line = String::new();
        let mut sep = "";
        for (id, alloc) in &self.alloc {
            if let Some(mask) = alloc.get_effective(typ) {
                let _ = write!(line, "{sep}{id}={}", mask.to_hex_string());
                sep = ";";
            }
        }
        if line.is_empty() {
            return line;
        }
        format!("{}{}:{line}\n", self.level, typ.resctrl_suffix())
    }
}

/// Resolved memory bandwidth allocation, percentages or MBps per cache ID
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MbSchema {
    pub alloc: BTreeMap<u64, u64>,
}

impl MbSchema {
    /// Render the schemata line, e.g. `MB:0=100;1=50\n`
    pub fn to_schemata_line(&self) -> String {
        if self.alloc.is_empty() {
            return String::new();
        }
        let values: Vec<String> = self
            .alloc
            .iter()
            .map(|(id, value)| format!("{id}={value}"))
            .collect();
        format!("MB:{}\n", values.join(";"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_falls_back_to_unified() {
        let mut alloc = CatAllocation::unified(Bitmask::new(0xff));
        assert_eq!(alloc.get(CatSchemaType::Code), None);
        assert_eq!(
            alloc.get_effective(CatSchemaType::Code),
            Some(Bitmask::new(0xff))
        );

        alloc.set(CatSchemaType::Data, Bitmask::new(0xf));
        assert_eq!(
            alloc.get_effective(CatSchemaType::Data),
            Some(Bitmask::new(0xf))
        );
        assert_eq!(
            alloc.get_effective(CatSchemaType::Unified),
            Some(Bitmask::new(0xff))
        );
    }

    #[test]
    fn test_cat_schemata_line() {
        let mut schema = CatSchema::new(CacheLevel::L3);
        assert_eq!(schema.to_schemata_line(CatSchemaType::Unified), "");

        schema.alloc.insert(1, CatAllocation::unified(Bitmask::new(0xff00)));
        let mut cdp = CatAllocation::unified(Bitmask::new(0xfff));
        cdp.set(CatSchemaType::Code, Bitmask::new(0x3));
        schema.alloc.insert(0, cdp);

        assert_eq!(
            schema.to_schemata_line(CatSchemaType::Unified),
            "L3:0=fff;1=ff00\n"
        );
        assert_eq!(
            schema.to_schemata_line(CatSchemaType::Code),
            "L3CODE:0=3;1=ff00\n"
        );
        assert_eq!(
            schema.to_schemata_line(CatSchemaType::Data),
            "L3DATA:0=fff;1=ff00\n"
        );
    }

    #[test]
    fn test_mb_schemata_line() {
        assert_eq!(MbSchema::default().to_schemata_line(), "");

        let schema = MbSchema {
            alloc: BTreeMap::from([(2, 30), (0, 100)]),
        };
        assert_eq!(schema.to_schemata_line(), "MB:0=100;2=30\n");
    }
}
