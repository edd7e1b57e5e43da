//! Task trait - 型付き Task の定義
//!
//! # 学習ポイント
//! - Associated Constants (`const TYPE`)
//! - Associated Types (`type Output`)
//! - Trait bounds の組み合わせ (Serialize + DeserializeOwned + Send + Sync + 'static)

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Task は func_path と引数の型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Echo {
///     message: String,
/// }
///
/// impl Task for Echo {
///     const TYPE: &'static str = "demo.echo.v1";
///     type Output = String;
/// }
/// ```
///
/// # Trait Bounds
/// - `DeserializeOwned`: args_blob / kwargs_blob からの復元のため
/// - `Serialize`: submit 側で同じ型から引数を組み立てるため
/// - `Send + Sync + 'static`: spawn された実行 task に move するため
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// func_path の定義
    ///
    /// # 命名規約
    /// - `{namespace}.{action}.v{major}`
    /// - 例: `billing.charge.v1`
    const TYPE: &'static str;

    /// 成功時に result として保存される値
    type Output: Serialize + Send + 'static;
}
