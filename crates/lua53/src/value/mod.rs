pub mod closure;
pub mod lua_string;
pub mod lua_table;
pub mod lua_value;
pub mod tostring;

pub use closure::{HostClosure, HostFn, LocVar, LuaClosure, LuaFunction, Proto, Upvalue, UpvalState, UpvalDesc};
pub use lua_string::LuaString;
pub use lua_table::LuaTable;
pub use lua_value::{LuaValue, TableRef, ThreadRef, UserData};
