//! デバッガコマンド

/// デバッガコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// ブレークポイントを設定
    Break(String),
    /// 実行継続
    Continue,
    /// ステップ実行
    Step,
    /// 停止中のスレッド一覧
    Threads,
    /// 操作対象のスレッドを選択
    SelectThread(i32),
    /// 論理スタック（asyncチェーンを含む）表示
    Backtrace,
    /// フレームの変数表示（名前省略時は見えるものすべて）
    FrameVariable { name: Option<String>, frame: usize },
    /// 変数を式として評価
    Print { name: String, frame: usize },
    /// フレームの分類を表示
    Classify { frame: usize },
    /// シンボル検索
    Find(String),
    /// 統計情報をJSONで出力
    StatisticsDump,
    /// ヘルプ表示
    Help,
    /// 終了
    Quit,
}

/// 末尾の数値引数をフレーム番号として取り出す
fn split_frame<'a>(args: &[&'a str]) -> Option<(Vec<&'a str>, usize)> {
    match args.split_last() {
        Some((last, rest)) if last.chars().all(|c| c.is_ascii_digit()) => {
            Some((rest.to_vec(), last.parse().ok()?))
        }
        _ => Some((args.to_vec(), 0)),
    }
}

impl Command {
    /// コマンド文字列をパースする
    pub fn parse(input: &str) -> Option<Self> {
        let parts: Vec<&str> = input.split_whitespace().collect();
        if parts.is_empty() {
            return None;
        }

        match parts[0] {
            "break" | "b" => {
                if parts.len() > 1 {
                    Some(Command::Break(parts[1..].join(" ")))
                } else {
                    None
                }
            }
            "continue" | "c" => Some(Command::Continue),
            "step" | "s" | "si" => Some(Command::Step),
            "threads" => Some(Command::Threads),
            "thread" => match parts.get(1..) {
                Some(["select", tid]) | Some([tid]) => tid.parse().ok().map(Command::SelectThread),
                _ => Some(Command::Threads),
            },
            "backtrace" | "bt" => Some(Command::Backtrace),
            "frame" | "fr" => match parts.get(1) {
                Some(&"variable") | Some(&"v") => Self::frame_variable(&parts[2..]),
                _ => None,
            },
            "v" | "var" => Self::frame_variable(&parts[1..]),
            "print" | "p" => {
                let (rest, frame) = split_frame(&parts[1..])?;
                match rest.as_slice() {
                    [name] => Some(Command::Print {
                        name: name.to_string(),
                        frame,
                    }),
                    _ => None,
                }
            }
            "classify" => {
                let (rest, frame) = split_frame(&parts[1..])?;
                rest.is_empty().then_some(Command::Classify { frame })
            }
            "find" => {
                if parts.len() > 1 {
                    Some(Command::Find(parts[1..].join(" ")))
                } else {
                    None
                }
            }
            "statistics" | "stats" => match parts.get(1) {
                Some(&"dump") | None => Some(Command::StatisticsDump),
                _ => None,
            },
            "help" | "h" | "?" => Some(Command::Help),
            "quit" | "q" | "exit" => Some(Command::Quit),
            _ => None,
        }
    }

    fn frame_variable(args: &[&str]) -> Option<Self> {
        let (rest, frame) = split_frame(args)?;
        match rest.as_slice() {
            [] => Some(Command::FrameVariable { name: None, frame }),
            [name] => Some(Command::FrameVariable {
                name: Some(name.to_string()),
                frame,
            }),
            _ => None,
        }
    }
}
