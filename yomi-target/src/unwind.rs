//! RBPチェーンによる物理スタックの巻き戻し

use crate::registers::{RBP, RIP, RSP};
use crate::{PhysicalFrame, RegisterSnapshot, Result, ThreadHandle, POINTER_SIZE};
use tracing::debug;

/// RBPチェーンをたどって物理フレームを列挙する
///
/// `[RBP]` に呼び出し元のRBP、`[RBP+8]` に戻りアドレスがある前提です。
/// RBPがNULL、戻りアドレスが0、チェーンが上位アドレスへ進まない、
/// 読み取りに失敗した、`max_depth` に達した、のいずれかで停止します。
///
/// # Arguments
/// * `thread` - 対象スレッド
/// * `top` - 最内フレームのレジスタ
/// * `max_depth` - 最大フレーム数
/// * `read_pointer` - ターゲットメモリからポインタを読むコールバック
pub fn walk_frame_pointers<F>(
    thread: ThreadHandle,
    top: RegisterSnapshot,
    max_depth: usize,
    mut read_pointer: F,
) -> Vec<PhysicalFrame>
where
    F: FnMut(u64) -> Result<u64>,
{
    let mut frames = Vec::new();
    let mut registers = top;

    for index in 0..max_depth {
        let Some(pc) = registers.pc() else {
            break;
        };
        let rbp = registers.get(RBP).unwrap_or(0);

        frames.push(PhysicalFrame {
            thread,
            index,
            pc,
            frame_base: rbp,
            registers: registers.clone(),
        });

        if rbp == 0 {
            break;
        }

        let (saved_rbp, return_address) =
            match (read_pointer(rbp), read_pointer(rbp + POINTER_SIZE)) {
                (Ok(saved), Ok(ret)) => (saved, ret),
                (Err(e), _) | (_, Err(e)) => {
                    debug!(%thread, index, rbp = format_args!("0x{:x}", rbp), "frame chain read failed: {}", e);
                    break;
                }
            };

        if return_address == 0 || (saved_rbp != 0 && saved_rbp <= rbp) {
            break;
        }

        registers = RegisterSnapshot::new()
            .with(RIP, return_address)
            .with(RBP, saved_rbp)
            .with(RSP, rbp + 2 * POINTER_SIZE);
    }

    frames
}
