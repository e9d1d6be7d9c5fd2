pub mod youget;
