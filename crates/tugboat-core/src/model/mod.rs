//! モデル定義
//!
//! 1リクエスト分の操作（OperationSpec）と、内部レジストリの命名規則を定義します。

mod operation;
mod reference;

// Re-exports
pub use operation::*;
pub use reference::*;
