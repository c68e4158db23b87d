//! DWARFロケーション式のデコード
//!
//! ロケーション式を実行せずに読み、リゾルバが扱える格納場所
//! （[`SlotLocation`] と [`StorageKind`] の組）に変換します。
//! 表現できない式は `SlotLocation::Unknown` になります。

use crate::{Result, SlotLocation, StorageKind};
use gimli::{Operation, Reader};

/// RBPのDWARFレジスタ番号
const RBP: u16 = 6;

/// CFAとRBPの差（保存RBPと戻りアドレスの2ワード）
const CFA_FROM_RBP: i64 = 16;

/// デコード済みのロケーション
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedLocation {
    pub location: SlotLocation,
    pub kind: StorageKind,
}

impl DecodedLocation {
    fn unknown() -> Self {
        Self {
            location: SlotLocation::Unknown,
            kind: StorageKind::Immediate,
        }
    }
}

/// ロケーション式デコーダ
#[derive(Debug, Clone, Copy)]
pub struct LocationDecoder {
    encoding: gimli::Encoding,
    /// asyncコンテキストを受け取るレジスタ
    context_register: u16,
    /// DW_OP_fbregのオフセットをRBP基準に直すための補正値
    frame_base_bias: i64,
}

impl LocationDecoder {
    /// デコーダを作成する
    pub fn new(encoding: gimli::Encoding, context_register: u16) -> Self {
        Self {
            encoding,
            context_register,
            frame_base_bias: 0,
        }
    }

    /// 関数のDW_AT_frame_baseに合わせた補正値を設定する
    pub fn with_frame_base_bias(mut self, bias: i64) -> Self {
        self.frame_base_bias = bias;
        self
    }

    /// DW_AT_frame_baseの式から補正値を求める
    ///
    /// `DW_OP_call_frame_cfa` ならCFA基準、それ以外はRBP基準とみなします。
    pub fn frame_base_bias_of<R: Reader>(&self, expr: gimli::Expression<R>) -> Result<i64> {
        let mut ops = expr.operations(self.encoding);
        match ops.next()? {
            Some(Operation::CallFrameCFA) => Ok(CFA_FROM_RBP),
            _ => Ok(0),
        }
    }

    /// ロケーション式をデコードする
    ///
    /// 空の式は「この区間では利用不可」を意味し、`None` を返します。
    pub fn decode<R: Reader>(&self, expr: gimli::Expression<R>) -> Result<Option<DecodedLocation>> {
        if expr.0.is_empty() {
            return Ok(None);
        }

        let mut base: Option<SlotLocation> = None;
        let mut indirect = false;
        let mut ops = expr.operations(self.encoding);

        while let Some(op) = ops.next()? {
            match op {
                Operation::Nop => {}
                Operation::Piece { .. } => break,
                _ if base.is_none() => match self.decode_base(op)? {
                    Some(first) => {
                        indirect = first.kind == StorageKind::Indirect;
                        base = Some(first.location);
                    }
                    None => return Ok(Some(DecodedLocation::unknown())),
                },
                Operation::PlusConstant { value } if !indirect => {
                    base = base.map(|location| offset_by(location, value as i64));
                }
                Operation::Deref { .. } if !indirect => indirect = true,
                _ => return Ok(Some(DecodedLocation::unknown())),
            }
        }

        let location = base.unwrap_or(SlotLocation::Unknown);
        let kind = if indirect && location != SlotLocation::Unknown {
            StorageKind::Indirect
        } else {
            StorageKind::Immediate
        };
        Ok(Some(DecodedLocation { location, kind }))
    }

    /// 式の先頭の演算子を格納場所に変換する
    fn decode_base<R: Reader>(&self, op: Operation<R>) -> Result<Option<DecodedLocation>> {
        let immediate = |location| {
            Some(DecodedLocation {
                location,
                kind: StorageKind::Immediate,
            })
        };

        let decoded = match op {
            Operation::Register { register } => immediate(SlotLocation::Register(register.0)),
            Operation::FrameOffset { offset } => {
                immediate(SlotLocation::FrameOffset(offset + self.frame_base_bias))
            }
            Operation::RegisterOffset {
                register, offset, ..
            } if register.0 == RBP => immediate(SlotLocation::FrameOffset(offset)),
            // レジスタが値のアドレスを保持している（address-only引数）
            Operation::RegisterOffset {
                register,
                offset: 0,
                ..
            } => Some(DecodedLocation {
                location: SlotLocation::Register(register.0),
                kind: StorageKind::Indirect,
            }),
            Operation::CallFrameCFA => immediate(SlotLocation::FrameOffset(CFA_FROM_RBP)),
            Operation::Address { address } => immediate(SlotLocation::Address(address)),
            Operation::EntryValue { expression } => {
                let mut inner = gimli::Expression(expression).operations(self.encoding);
                match (inner.next()?, inner.next()?) {
                    (Some(Operation::Register { register }), None)
                        if register.0 == self.context_register =>
                    {
                        immediate(SlotLocation::ContextOffset(0))
                    }
                    _ => None,
                }
            }
            _ => None,
        };

        Ok(decoded)
    }
}

/// オフセット付きの格納場所をずらす
fn offset_by(location: SlotLocation, delta: i64) -> SlotLocation {
    match location {
        SlotLocation::FrameOffset(offset) => SlotLocation::FrameOffset(offset + delta),
        SlotLocation::ContextOffset(offset) => SlotLocation::ContextOffset(offset + delta),
        SlotLocation::Address(addr) => SlotLocation::Address(addr.wrapping_add(delta as u64)),
        _ => SlotLocation::Unknown,
    }
}
