//! DWARF解析のユーティリティ関数

use crate::Result;
use gimli::Reader;
use std::ops::Range;

/// DIE属性の読み出しユーティリティ
pub struct DieReader;

impl DieReader {
    /// DIEのアドレス範囲を取得する
    ///
    /// low_pc/high_pcとDW_AT_rangesの両方に対応します。空の範囲は除きます。
    pub fn ranges<R: Reader>(
        dwarf: &gimli::Dwarf<R>,
        unit: &gimli::Unit<R>,
        entry: &gimli::DebuggingInformationEntry<R>,
    ) -> Result<Vec<Range<u64>>> {
        let mut ranges = Vec::new();
        let mut iter = dwarf.die_ranges(unit, entry)?;
        while let Some(range) = iter.next()? {
            if range.begin < range.end {
                ranges.push(range.begin..range.end);
            }
        }
        ranges.sort_by_key(|range| range.start);
        Ok(ranges)
    }

    /// 文字列属性を取得する
    pub fn string_attr<R: Reader>(
        dwarf: &gimli::Dwarf<R>,
        unit: &gimli::Unit<R>,
        entry: &gimli::DebuggingInformationEntry<R>,
        name: gimli::DwAt,
    ) -> Result<Option<String>> {
        let Some(value) = entry.attr_value(name)? else {
            return Ok(None);
        };
        let raw = dwarf.attr_string(unit, value)?;
        Ok(Some(raw.to_string_lossy()?.into_owned()))
    }

    /// 関数や変数の名前を取得する
    ///
    /// リンケージ名があればそちらを優先します（シンボルテーブルと突き合わせるため）。
    pub fn linkage_or_name<R: Reader>(
        dwarf: &gimli::Dwarf<R>,
        unit: &gimli::Unit<R>,
        entry: &gimli::DebuggingInformationEntry<R>,
    ) -> Result<Option<String>> {
        for attr in [gimli::DW_AT_linkage_name, gimli::DW_AT_MIPS_linkage_name] {
            if let Some(name) = Self::string_attr(dwarf, unit, entry, attr)? {
                return Ok(Some(name));
            }
        }
        Self::string_attr(dwarf, unit, entry, gimli::DW_AT_name)
    }

    /// DW_AT_typeが指す型の名前とサイズを取得する
    pub fn type_of<R: Reader>(
        dwarf: &gimli::Dwarf<R>,
        unit: &gimli::Unit<R>,
        entry: &gimli::DebuggingInformationEntry<R>,
    ) -> Result<(Option<String>, Option<u64>)> {
        let Some(gimli::AttributeValue::UnitRef(offset)) = entry.attr_value(gimli::DW_AT_type)?
        else {
            return Ok((None, None));
        };

        let type_entry = unit.entry(offset)?;
        let name = Self::string_attr(dwarf, unit, &type_entry, gimli::DW_AT_name)?;
        let size = type_entry
            .attr_value(gimli::DW_AT_byte_size)?
            .and_then(|value| value.udata_value());
        Ok((name, size))
    }

    /// DW_AT_calling_conventionの値を取得する
    pub fn calling_convention<R: Reader>(
        entry: &gimli::DebuggingInformationEntry<R>,
    ) -> Result<Option<u8>> {
        Ok(match entry.attr_value(gimli::DW_AT_calling_convention)? {
            Some(gimli::AttributeValue::CallingConvention(cc)) => Some(cc.0),
            Some(value) => value.udata_value().map(|v| v as u8),
            None => None,
        })
    }
}
